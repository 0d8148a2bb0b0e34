use std::{
    num::NonZeroUsize,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, Sender, channel},
    },
    thread::JoinHandle,
};

use log::{debug, info};
use params::{Parameter, ParameterType};

use crate::{
    data::{DataBatch, DataProvider},
    machine::{GradientMachine, PassKind, ReplicaFactory},
};

/// Aggregate result of one synchronous pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassStats {
    pub cost: f64,
    pub samples: usize,
}

impl PassStats {
    pub fn avg_cost(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.cost / self.samples as f64
        }
    }
}

/// One worker's contribution to a pass, handed to the controller after
/// the worker drained its share of the epoch.
struct WorkerReport {
    grads: Vec<Vec<f32>>,
    cost: f64,
    samples: usize,
}

/// Synchronous multi-threaded gradient machine.
///
/// N worker threads each own a network replica; slave replicas share
/// the main replica's VALUE buffers and own private gradients. A pass
/// is two barrier rounds: value-ready releases the workers into the
/// epoch, grad-ready closes it. Between the two, the controller drains
/// exactly N gradient reports from the fan-in channel and reduces them
/// into GRADIENT_SUM, so aggregation happens after the workers are done
/// and no gradient lock exists.
pub struct BatchGradientMachine {
    params: Vec<Parameter>,
    value_ready: Arc<Barrier>,
    grad_ready: Arc<Barrier>,
    stopping: Arc<AtomicBool>,
    reports: Receiver<WorkerReport>,
    workers: Vec<JoinHandle<()>>,
}

/// Settings for the synchronous worker pool.
#[derive(Clone, Copy, Debug)]
pub struct BatchConfig {
    pub trainer_count: NonZeroUsize,
    pub batch_size: usize,
}

impl BatchGradientMachine {
    /// Builds the replicas and spawns the worker threads.
    ///
    /// The main replica's parameters get a GRADIENT_SUM buffer holding
    /// the reduced epoch gradient after each `train_pass`.
    pub fn start(
        config: BatchConfig,
        factory: ReplicaFactory,
        provider: Arc<dyn DataProvider>,
    ) -> Self {
        let n = config.trainer_count.get();
        let main = factory(None);
        let mut params: Vec<Parameter> = main.parameters().to_vec();
        for p in params.iter_mut() {
            if !p.is_static() {
                p.enable(ParameterType::GradientSum);
            }
        }

        let value_ready = Arc::new(Barrier::new(n + 1));
        let grad_ready = Arc::new(Barrier::new(n + 1));
        let stopping = Arc::new(AtomicBool::new(false));
        let (tx, reports) = channel();

        // the main replica only seeds the shared parameters; every
        // worker runs a slave replica aliasing its VALUE storage
        drop(main);

        let mut workers = Vec::with_capacity(n);
        for worker_id in 0..n {
            let machine = factory(Some(&params));
            workers.push(Self::spawn_worker(
                worker_id,
                machine,
                config.batch_size,
                Arc::clone(&provider),
                Arc::clone(&value_ready),
                Arc::clone(&grad_ready),
                Arc::clone(&stopping),
                tx.clone(),
            ));
        }
        drop(tx);

        info!(trainer_count = n; "batch gradient machine started");
        Self {
            params,
            value_ready,
            grad_ready,
            stopping,
            reports,
            workers,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_worker(
        worker_id: usize,
        mut machine: Box<dyn GradientMachine>,
        batch_size: usize,
        provider: Arc<dyn DataProvider>,
        value_ready: Arc<Barrier>,
        grad_ready: Arc<Barrier>,
        stopping: Arc<AtomicBool>,
        tx: Sender<WorkerReport>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let mut batch = DataBatch::default();
            loop {
                value_ready.wait();
                if stopping.load(Ordering::Acquire) {
                    break;
                }

                let mut cost = 0.0;
                let mut samples = 0;
                while provider.next_batch(batch_size, &mut batch) > 0 {
                    cost += machine.forward_backward(&batch, PassKind::Train, None);
                    samples += batch.len();
                }

                let grads = machine
                    .parameters()
                    .iter()
                    .filter(|p| !p.is_static())
                    .map(|p| p.dense(ParameterType::Gradient).to_vec())
                    .collect();
                for p in machine.parameters() {
                    if !p.is_static() {
                        p.clear_gradient();
                    }
                }
                debug!(worker_id, samples; "pass share done");
                tx.send(WorkerReport { grads, cost, samples })
                    .unwrap_or_else(|_| panic!("controller gone mid-pass"));

                grad_ready.wait();
            }
        })
    }

    /// Runs one synchronous pass over the provider's current epoch and
    /// reduces every worker's gradient into GRADIENT_SUM.
    ///
    /// The caller resets the provider between passes.
    pub fn train_pass(&self) -> PassStats {
        self.value_ready.wait();

        let n = self.workers.len();
        let mut stats = PassStats::default();
        for _ in 0..n {
            let report = self
                .reports
                .recv()
                .unwrap_or_else(|_| panic!("worker thread died mid-pass"));
            let mut grads = report.grads.iter();
            for p in self.params.iter().filter(|p| !p.is_static()) {
                let grad = grads
                    .next()
                    .unwrap_or_else(|| panic!("worker report missing a parameter"));
                p.dense(ParameterType::GradientSum).add_slice(grad);
            }
            stats.cost += report.cost;
            stats.samples += report.samples;
        }

        self.grad_ready.wait();
        stats
    }

    /// Main-replica parameters, including the reduced GRADIENT_SUM.
    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    /// Zeroes GRADIENT_SUM before the next pass.
    pub fn clear_gradient_sum(&self) {
        for p in self.params.iter().filter(|p| !p.is_static()) {
            p.buf(ParameterType::GradientSum).zero();
        }
    }

    /// Stops and joins the worker threads.
    pub fn finish(mut self) {
        self.stopping.store(true, Ordering::Release);
        self.value_ready.wait();
        for handle in self.workers.drain(..) {
            handle
                .join()
                .unwrap_or_else(|_| panic!("worker thread panicked"));
        }
        info!("batch gradient machine stopped");
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use crate::{InMemoryDataProvider, LinearNetwork};

    use super::*;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn ramp_provider(n: usize) -> Arc<InMemoryDataProvider> {
        let inputs = Array2::from_shape_fn((n, 2), |(i, j)| (i + j) as f32);
        let targets = Array2::from_shape_fn((n, 1), |(i, _)| i as f32);
        Arc::new(InMemoryDataProvider::new(inputs, targets))
    }

    fn factory() -> ReplicaFactory {
        Box::new(|main| match main {
            None => Box::new(LinearNetwork::new(2, 1)),
            Some(params) => Box::new(LinearNetwork::replica(params)),
        })
    }

    fn machine(k: usize, provider: Arc<InMemoryDataProvider>) -> BatchGradientMachine {
        BatchGradientMachine::start(
            BatchConfig {
                trainer_count: NonZeroUsize::new(k).unwrap(),
                batch_size: 3,
            },
            factory(),
            provider,
        )
    }

    #[test]
    fn barrier_liveness() {
        init_logs();
        for k in [1, 4, 16] {
            for passes in [0, 1, 5] {
                let provider = ramp_provider(10);
                let m = machine(k, Arc::clone(&provider));
                for _ in 0..passes {
                    provider.set_skip_shuffle();
                    provider.reset();
                    m.train_pass();
                }
                m.finish();
            }
        }
    }

    #[test]
    fn gradient_sum_equals_single_threaded_gradient() {
        let provider = ramp_provider(20);

        // single-replica reference over the same epoch
        let mut reference = LinearNetwork::new(2, 1);
        let mut batch = DataBatch::default();
        let mut want_cost = 0.0;
        while provider.next_batch(3, &mut batch) > 0 {
            want_cost += reference.forward_backward(&batch, PassKind::Train, None);
        }
        let want = reference
            .parameter()
            .dense(ParameterType::Gradient)
            .to_vec();

        for k in [1, 4] {
            let provider = ramp_provider(20);
            let m = machine(k, Arc::clone(&provider));
            provider.set_skip_shuffle();
            provider.reset();
            let stats = m.train_pass();

            let got = m.params[0].dense(ParameterType::GradientSum).to_vec();
            for (g, w) in got.iter().zip(&want) {
                assert!((g - w).abs() < 1e-3, "k={k}: {got:?} vs {want:?}");
            }
            assert_eq!(stats.samples, 20);
            assert!((stats.cost - want_cost).abs() < 1e-6 * want_cost.abs().max(1.0));
            m.finish();
        }
    }
}
