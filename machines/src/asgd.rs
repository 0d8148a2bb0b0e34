use std::{
    num::NonZeroUsize,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc::{Receiver, Sender, channel},
    },
    thread::JoinHandle,
};

use log::{debug, info};
use params::{AtomicBuf, Buffer, Parameter, ParameterType};

use crate::{
    batch::PassStats,
    data::{DataBatch, DataProvider},
    machine::{GradientMachine, PassKind, ReplicaFactory},
};

/// Settings for the asynchronous worker pool.
#[derive(Clone, Copy, Debug)]
pub struct AsgdConfig {
    pub trainer_count: NonZeroUsize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Polynomial decay: `lr = base * (1 + a * samples)^(-b)`.
    pub decay_a: f32,
    pub decay_b: f32,
    pub momentum: f32,
}

/// Per-thread updater applying gradients to the shared parameters
/// immediately after every mini-batch.
///
/// Dense parameters take the plain momentum-SGD step on every cell.
/// Sparse-update parameters only touch the rows seen in the batch; the
/// per-row UPDATE_TIME counter records the batch that last touched a
/// row, and the elapsed count decays the row's momentum as if the
/// skipped steps had run with a zero gradient. `finish_pass` flushes
/// the decay every row still owes at the end of the pass.
pub(crate) struct AsgdThreadUpdater {
    learning_rate: f32,
    decay_a: f32,
    decay_b: f32,
    momentum: f32,
    global_samples: Arc<AtomicUsize>,
    /// Batch counter within the current pass, 1-based after start_batch.
    timer: u32,
    cur_lr: f32,
}

/// Sum of `m * mu^k` for `k in 1..=skipped`, the value drift a row owes
/// for the batches it was not touched.
fn momentum_catch_up(m: f32, mu: f32, skipped: u32) -> f32 {
    if skipped == 0 || mu == 0.0 {
        0.0
    } else if mu == 1.0 {
        m * skipped as f32
    } else {
        m * mu * (1.0 - mu.powi(skipped as i32)) / (1.0 - mu)
    }
}

impl AsgdThreadUpdater {
    fn new(config: &AsgdConfig, global_samples: Arc<AtomicUsize>) -> Self {
        Self {
            learning_rate: config.learning_rate,
            decay_a: config.decay_a,
            decay_b: config.decay_b,
            momentum: config.momentum,
            global_samples,
            timer: 0,
            cur_lr: config.learning_rate,
        }
    }

    pub(crate) fn start_pass(&mut self, params: &[Parameter]) {
        self.timer = 0;
        for p in params {
            if let Some(ut) = p.update_time() {
                ut.zero();
            }
        }
    }

    /// Advances the batch timer and recomputes the decayed learning rate
    /// from the global sample counter.
    pub(crate) fn start_batch(&mut self) {
        self.timer += 1;
        let n = self.global_samples.load(Ordering::Relaxed) as f32;
        self.cur_lr =
            self.learning_rate * (1.0 + self.decay_a * n).powf(-self.decay_b);
    }

    #[cfg(test)]
    pub(crate) fn learning_rate(&self) -> f32 {
        self.cur_lr
    }

    /// Applies and clears the parameter's gradient.
    ///
    /// Writes to the shared VALUE/MOMENTUM cells race with other
    /// workers and can lose updates; that is the accepted cost of the
    /// async path.
    pub(crate) fn update(&mut self, p: &Parameter) {
        let value = shared_cells(p, ParameterType::Value);
        let momentum = shared_cells(p, ParameterType::Momentum);
        let lr = self.cur_lr;
        let mu = self.momentum;

        match p.buf(ParameterType::Gradient) {
            Buffer::Dense(grad) => {
                let g = grad.read();
                for (i, gi) in g.iter().enumerate() {
                    let m = mu * momentum.get(i) + gi;
                    momentum.set(i, m);
                    value.add(i, -lr * m);
                }
                drop(g);
                grad.zero();
            }
            Buffer::SparseRow(grad) => {
                let ut = p
                    .update_time()
                    .unwrap_or_else(|| panic!("sparse parameter {} without update time", p.name()));
                let width = p.config().width;
                grad.for_each_row(|row, g| {
                    let elapsed = self.timer - ut.get(row);
                    let skipped = elapsed - 1;
                    let decay = mu.powi(elapsed as i32);
                    for (col, gi) in g.iter().enumerate() {
                        let i = row * width + col;
                        let m_old = momentum.get(i);
                        let catch_up = momentum_catch_up(m_old, mu, skipped);
                        let m = decay * m_old + gi;
                        momentum.set(i, m);
                        value.add(i, -lr * (catch_up + m));
                    }
                    ut.set(row, self.timer);
                });
                grad.clear();
            }
            Buffer::Atomic(_) => panic!("gradient of {} cannot be lock-free", p.name()),
        }
    }

    /// Flushes the momentum drift every untouched row still owes.
    pub(crate) fn finish_pass(&mut self, params: &[Parameter]) {
        if self.momentum == 0.0 {
            return;
        }
        let lr = self.cur_lr;
        let mu = self.momentum;
        for p in params.iter().filter(|p| p.is_sparse_update()) {
            let Some(ut) = p.update_time() else { continue };
            let value = shared_cells(p, ParameterType::Value);
            let momentum = shared_cells(p, ParameterType::Momentum);
            let width = p.config().width;
            for row in 0..p.config().height {
                let skipped = self.timer - ut.get(row);
                if skipped == 0 {
                    continue;
                }
                let decay = mu.powi(skipped as i32);
                for col in 0..width {
                    let i = row * width + col;
                    let m_old = momentum.get(i);
                    value.add(i, -lr * momentum_catch_up(m_old, mu, skipped));
                    momentum.set(i, decay * m_old);
                }
                ut.set(row, self.timer);
            }
        }
    }
}

fn shared_cells(p: &Parameter, ty: ParameterType) -> &AtomicBuf {
    p.buf(ty)
        .as_atomic()
        .unwrap_or_else(|| panic!("{ty:?} of {} must be lock-free for async SGD", p.name()))
}

/// Asynchronous multi-threaded gradient machine.
///
/// Same barrier skeleton as the synchronous pool, but no gradient
/// aggregation: every worker applies its gradients straight to the
/// shared lock-free parameters, one mini-batch at a time.
pub struct AsgdSparseGradientMachine {
    params: Vec<Parameter>,
    value_ready: Arc<Barrier>,
    grad_ready: Arc<Barrier>,
    stopping: Arc<AtomicBool>,
    reports: Receiver<PassStats>,
    workers: Vec<JoinHandle<()>>,
}

impl AsgdSparseGradientMachine {
    /// Builds the replicas and spawns the worker threads.
    ///
    /// # Panics
    /// If a parameter is static, or the shared VALUE/MOMENTUM buffers
    /// are not lock-free.
    pub fn start(
        config: AsgdConfig,
        factory: ReplicaFactory,
        provider: Arc<dyn DataProvider>,
    ) -> Self {
        let n = config.trainer_count.get();
        let main = factory(None);
        let params: Vec<Parameter> = main.parameters().to_vec();
        for p in &params {
            assert!(
                !p.is_static(),
                "static parameter {} cannot join async updates",
                p.name()
            );
            shared_cells(p, ParameterType::Value);
            shared_cells(p, ParameterType::Momentum);
        }
        drop(main);

        let value_ready = Arc::new(Barrier::new(n + 1));
        let grad_ready = Arc::new(Barrier::new(n + 1));
        let stopping = Arc::new(AtomicBool::new(false));
        let global_samples = Arc::new(AtomicUsize::new(0));
        let (tx, reports) = channel();

        let mut workers = Vec::with_capacity(n);
        for worker_id in 0..n {
            let machine = factory(Some(&params));
            workers.push(Self::spawn_worker(
                worker_id,
                machine,
                config,
                Arc::clone(&provider),
                Arc::clone(&value_ready),
                Arc::clone(&grad_ready),
                Arc::clone(&stopping),
                Arc::clone(&global_samples),
                tx.clone(),
            ));
        }
        drop(tx);

        info!(trainer_count = n; "async gradient machine started");
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
        config: AsgdConfig,
        provider: Arc<dyn DataProvider>,
        value_ready: Arc<Barrier>,
        grad_ready: Arc<Barrier>,
        stopping: Arc<AtomicBool>,
        global_samples: Arc<AtomicUsize>,
        tx: Sender<PassStats>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let mut updater = AsgdThreadUpdater::new(&config, Arc::clone(&global_samples));
            let mut batch = DataBatch::default();
            loop {
                value_ready.wait();
                if stopping.load(Ordering::Acquire) {
                    break;
                }

                updater.start_pass(machine.parameters());
                let mut stats = PassStats::default();
                while provider.next_batch(config.batch_size, &mut batch) > 0 {
                    updater.start_batch();
                    stats.cost += machine.forward_backward(
                        &batch,
                        PassKind::Train,
                        Some(&mut |p| updater.update(p)),
                    );
                    stats.samples += batch.len();
                    global_samples.fetch_add(batch.len(), Ordering::Relaxed);
                }
                updater.finish_pass(machine.parameters());
                debug!(worker_id, samples = stats.samples; "async pass share done");
                tx.send(stats)
                    .unwrap_or_else(|_| panic!("controller gone mid-pass"));

                grad_ready.wait();
            }
        })
    }

    /// Runs one asynchronous pass over the provider's current epoch.
    /// Costs are measured before each worker's own update, so they lag
    /// the concurrent progress of other workers.
    pub fn train_pass(&self) -> PassStats {
        self.value_ready.wait();
        let mut stats = PassStats::default();
        for _ in 0..self.workers.len() {
            let report = self
                .reports
                .recv()
                .unwrap_or_else(|_| panic!("worker thread died mid-pass"));
            stats.cost += report.cost;
            stats.samples += report.samples;
        }
        self.grad_ready.wait();
        stats
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.params
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
        info!("async gradient machine stopped");
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use params::ParameterConfig;

    use crate::{InMemoryDataProvider, LinearNetwork};

    use super::*;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config(momentum: f32) -> AsgdConfig {
        AsgdConfig {
            trainer_count: NonZeroUsize::new(1).unwrap(),
            batch_size: 2,
            learning_rate: 0.1,
            decay_a: 0.0,
            decay_b: 0.0,
            momentum,
        }
    }

    fn dense_param() -> Parameter {
        let mut p = Parameter::new(0, "w", ParameterConfig::dense(3, 2));
        p.enable_atomic(ParameterType::Value);
        p.enable_atomic(ParameterType::Momentum);
        p.enable(ParameterType::Gradient);
        p
    }

    fn sparse_param() -> Parameter {
        let mut p = Parameter::new(0, "w", ParameterConfig::sparse(3, 2));
        p.enable_atomic(ParameterType::Value);
        p.enable_atomic(ParameterType::Momentum);
        p.enable_sparse_row(ParameterType::Gradient);
        p.enable_update_time();
        p
    }

    #[test]
    fn sparse_matches_dense_without_momentum() {
        let samples = Arc::new(AtomicUsize::new(0));
        let dense = dense_param();
        let sparse = sparse_param();
        let mut up_d = AsgdThreadUpdater::new(&config(0.0), Arc::clone(&samples));
        let mut up_s = AsgdThreadUpdater::new(&config(0.0), Arc::clone(&samples));
        up_d.start_pass(std::slice::from_ref(&dense));
        up_s.start_pass(std::slice::from_ref(&sparse));

        // batch 1 touches rows 0 and 2, batch 2 touches row 2 only
        let batches: [&[(usize, [f32; 2])]; 2] =
            [&[(0, [1.0, 2.0]), (2, [3.0, 4.0])], &[(2, [1.0, -1.0])]];
        for rows in batches {
            up_d.start_batch();
            up_s.start_batch();
            for (row, g) in rows {
                let mut full = [0.0; 6];
                full[row * 2..row * 2 + 2].copy_from_slice(g);
                dense.dense(ParameterType::Gradient).add_slice(&full);
                sparse
                    .buf(ParameterType::Gradient)
                    .as_sparse_row()
                    .unwrap()
                    .add_row(*row, g);
            }
            up_d.update(&dense);
            up_s.update(&sparse);
        }
        up_d.finish_pass(std::slice::from_ref(&dense));
        up_s.finish_pass(std::slice::from_ref(&sparse));

        let vd = dense.buf(ParameterType::Value).as_atomic().unwrap().to_vec();
        let vs = sparse.buf(ParameterType::Value).as_atomic().unwrap().to_vec();
        for (a, b) in vd.iter().zip(&vs) {
            assert!((a - b).abs() < 1e-6, "{vd:?} vs {vs:?}");
        }

        let ut = sparse.update_time().unwrap();
        assert_eq!(ut.get(0), 1); // last touched by batch 1
        assert_eq!(ut.get(1), 0); // never touched
        assert_eq!(ut.get(2), 2);
    }

    #[test]
    fn stale_row_momentum_decays() {
        let sparse = sparse_param();
        let mut up = AsgdThreadUpdater::new(&config(0.5), Arc::new(AtomicUsize::new(0)));
        up.start_pass(std::slice::from_ref(&sparse));

        let grad = sparse.buf(ParameterType::Gradient).as_sparse_row().unwrap();

        // batch 1: row 0 seen, builds momentum g = 1
        up.start_batch();
        grad.add_row(0, &[1.0, 0.0]);
        up.update(&sparse);
        // batches 2 and 3: row 0 unseen
        up.start_batch();
        up.start_batch();
        // batch 4: row 0 seen again with zero gradient
        up.start_batch();
        grad.add_row(0, &[0.0, 0.0]);
        up.update(&sparse);

        // m decayed over 3 elapsed steps: 1 * 0.5^3
        let m = sparse
            .buf(ParameterType::Momentum)
            .as_atomic()
            .unwrap()
            .get(0);
        assert!((m - 0.125).abs() < 1e-6);

        // value took the full geometric catch-up: lr * (m + m*mu + m*mu^2 + m*mu^3)
        let v = sparse.buf(ParameterType::Value).as_atomic().unwrap().get(0);
        let want = -0.1 * (1.0 + 0.5 + 0.25 + 0.125);
        assert!((v - want).abs() < 1e-6, "{v} vs {want}");
        assert_eq!(sparse.update_time().unwrap().get(0), 4);
    }

    #[test]
    fn learning_rate_decays_with_samples() {
        let samples = Arc::new(AtomicUsize::new(0));
        let mut up = AsgdThreadUpdater::new(
            &AsgdConfig {
                decay_a: 1.0,
                decay_b: 1.0,
                ..config(0.0)
            },
            Arc::clone(&samples),
        );
        up.start_batch();
        assert_eq!(up.learning_rate(), 0.1);

        samples.store(9, Ordering::Relaxed);
        up.start_batch();
        assert!((up.learning_rate() - 0.01).abs() < 1e-7);
    }

    #[test]
    fn async_pool_trains_and_stops() {
        init_logs();
        let inputs = Array2::from_shape_fn((12, 2), |(i, j)| ((i + j) % 3) as f32);
        let targets = inputs.dot(&ndarray::arr2(&[[1.0], [-2.0]]));
        let provider = Arc::new(InMemoryDataProvider::new(inputs, targets));

        let factory: ReplicaFactory = Box::new(|main| match main {
            None => Box::new(LinearNetwork::new_atomic(2, 1)),
            Some(params) => Box::new(LinearNetwork::replica(params)),
        });
        let m = AsgdSparseGradientMachine::start(
            AsgdConfig {
                trainer_count: NonZeroUsize::new(4).unwrap(),
                ..config(0.0)
            },
            factory,
            Arc::clone(&provider) as Arc<dyn DataProvider>,
        );

        let mut last = f64::INFINITY;
        for _ in 0..30 {
            provider.set_skip_shuffle();
            provider.reset();
            last = m.train_pass().avg_cost();
        }
        m.finish();
        assert!(last < 0.2, "async sgd failed to fit: {last}");
    }
}
