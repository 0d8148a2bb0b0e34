use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::info;
use machines::PassKind;
use params::{Parameter, ParameterType};
use pserver::{
    ClientRole, Op, ParameterClient, ParameterServer, PreparedOperations, Status, UpdateMode,
};

use crate::{Algorithm, OptimizationConfig, Owlqn, Result};

/// The trainer-side hooks a training loop drives around each pass and
/// batch. Remote implementations ship gradients to the parameter
/// server and pull updated values back.
pub trait ParameterUpdater: Send {
    fn init(&mut self, params: &[Parameter]) -> Result<()>;

    /// Blocks until the pass may begin, where the protocol requires a
    /// rendezvous.
    fn start_pass(&mut self);

    /// Closes the pass. Returns whether the optimizer accepted it.
    fn finish_pass(&mut self, cost: f64) -> Result<bool>;

    fn start_batch(&mut self, batch_size: usize) -> PassKind;

    fn finish_batch(&mut self, cost: f64) -> Result<()>;

    /// Per-parameter hook invoked by the gradient machine right after
    /// backward.
    fn update(&mut self, param: &Parameter);

    /// Joins the controller thread. Must be called after the last pass.
    fn deinit(&mut self);
}

/// Concatenates one buffer type of every parameter into the server's
/// flat layout.
fn gather(params: &[Parameter], ty: ParameterType) -> Vec<f32> {
    let total = params.iter().map(|p| p.size()).sum();
    let mut out = Vec::with_capacity(total);
    for p in params {
        out.extend_from_slice(p.dense(ty).read().as_slice());
    }
    out
}

/// Splits a flat server vector back into per-parameter buffers.
fn scatter(params: &[Parameter], ty: ParameterType, data: &[f32]) {
    let mut offset = 0;
    for p in params {
        p.dense(ty).copy_from_slice(&data[offset..offset + p.size()]);
        offset += p.size();
    }
}

/// Updater for full-batch OWLQN training.
///
/// Per batch it folds the fresh gradient into the gradient sum; per
/// pass it pushes the summed gradient together with the pass cost and
/// blocks until the optimizer thread sends the next point back. The
/// push itself is the pass synchronization, there is no separate
/// rendezvous.
pub struct BatchRemoteParameterUpdater {
    server: Arc<ParameterServer>,
    config: OptimizationConfig,
    expected_pass_count: usize,
    client: ParameterClient,
    params: Vec<Parameter>,
    batch_size: usize,
    pass_cost: f64,
    pass_accepted: Arc<AtomicBool>,
    controller: Option<JoinHandle<()>>,
}

impl BatchRemoteParameterUpdater {
    pub fn new(
        server: Arc<ParameterServer>,
        config: OptimizationConfig,
        expected_pass_count: usize,
    ) -> Self {
        assert_eq!(
            config.algorithm,
            Algorithm::Owlqn,
            "batch remote updater only drives owlqn, got {}",
            config.algorithm
        );
        let client = ParameterClient::new(Arc::clone(&server), ClientRole::Trainer);
        let batch_size = config.batch_size;
        Self {
            server,
            config,
            expected_pass_count,
            client,
            params: Vec::new(),
            batch_size,
            pass_cost: 0.0,
            pass_accepted: Arc::new(AtomicBool::new(false)),
            controller: None,
        }
    }
}

impl ParameterUpdater for BatchRemoteParameterUpdater {
    fn init(&mut self, params: &[Parameter]) -> Result<()> {
        for p in params {
            assert!(
                p.is_enabled(ParameterType::GradientSum),
                "parameter {} has no gradient sum buffer",
                p.name()
            );
        }
        self.params = params.to_vec();
        self.client.set_parameter(&gather(params, ParameterType::Value))?;
        self.client.set_status(Status::ParameterReady);

        let server = Arc::clone(&self.server);
        let config = self.config.clone();
        let passes = self.expected_pass_count;
        let accepted = Arc::clone(&self.pass_accepted);
        self.controller = Some(thread::spawn(move || {
            let client = ParameterClient::new(server, ClientRole::Controller);
            let mut owlqn = Owlqn::new(client, &config, passes);
            owlqn
                .train(&accepted)
                .unwrap_or_else(|e| panic!("owlqn controller failed: {e}"));
            owlqn
                .deinit()
                .unwrap_or_else(|e| panic!("owlqn controller failed: {e}"));
        }));
        Ok(())
    }

    fn start_pass(&mut self) {}

    fn finish_pass(&mut self, cost: f64) -> Result<bool> {
        let grad_sum = gather(&self.params, ParameterType::GradientSum);
        let total_cost = (self.pass_cost + cost) as f32;
        let value = self.client.send_and_receive_parameter(
            UpdateMode::AddGradient,
            &grad_sum,
            self.batch_size,
            total_cost,
            true,
        )?;
        if let Some(value) = value {
            scatter(&self.params, ParameterType::Value, &value);
        }
        for p in &self.params {
            p.dense(ParameterType::GradientSum).zero();
        }
        self.pass_cost = 0.0;
        Ok(self.pass_accepted.load(Ordering::Relaxed))
    }

    fn start_batch(&mut self, batch_size: usize) -> PassKind {
        self.batch_size = batch_size;
        PassKind::Train
    }

    fn finish_batch(&mut self, cost: f64) -> Result<()> {
        self.pass_cost += cost;
        Ok(())
    }

    fn update(&mut self, param: &Parameter) {
        param
            .dense(ParameterType::GradientSum)
            .add(param.dense(ParameterType::Gradient));
        param.clear_gradient();
    }

    fn deinit(&mut self) {
        if let Some(handle) = self.controller.take() {
            if handle.join().is_err() {
                panic!("owlqn controller panicked");
            }
        }
    }
}

/// Server-side pass schedule for variance-reduced SGD: canonicalize
/// the pushed full gradient as the anchor, then apply one SGD step per
/// mini-batch round until every trainer asked to finish.
fn vr_controller(client: &ParameterClient, num_passes: usize) -> Result<()> {
    let grad = client.gradient_vector();
    let grad_sum = client.gradient_sum_vector();
    for pass in 0..num_passes {
        // full-gradient sub-pass
        client.wait_pass_start();
        let mut ops = PreparedOperations::new();
        ops.add(Op::StartPass);
        client.do_operation(&ops, false, false, false)?;

        let mut ops = PreparedOperations::new();
        ops.add(Op::CopyZero {
            src: grad,
            dst: grad_sum,
        });
        client.do_operation(&ops, true, true, false)?;
        info!(pass; "anchor gradient captured");

        // optimization sub-pass
        client.wait_pass_start();
        let mut ops = PreparedOperations::new();
        ops.add(Op::StartPass);
        client.do_operation(&ops, false, false, false)?;

        loop {
            let mut ops = PreparedOperations::new();
            ops.add(Op::Sgd);
            client.do_operation(&ops, true, true, false)?;
            if client.is_pass_finish() {
                break;
            }
        }

        let mut ops = PreparedOperations::new();
        ops.add(Op::FinishPass);
        client.do_operation(&ops, true, true, true)?;
    }
    Ok(())
}

/// Updater for SVRG training.
///
/// The trainer side pushes the accumulated full gradient once per
/// anchor sub-pass and one variance-reduced gradient per mini-batch,
/// receiving the stepped value back each time.
pub struct VRRemoteParameterUpdater {
    server: Arc<ParameterServer>,
    expected_pass_count: usize,
    client: ParameterClient,
    params: Vec<Parameter>,
    batch_size: usize,
    controller: Option<JoinHandle<()>>,
}

impl VRRemoteParameterUpdater {
    pub fn new(
        server: Arc<ParameterServer>,
        config: &OptimizationConfig,
        expected_pass_count: usize,
    ) -> Self {
        assert_eq!(
            config.algorithm,
            Algorithm::Svrg,
            "variance-reduced updater only drives svrg, got {}",
            config.algorithm
        );
        let client = ParameterClient::new(Arc::clone(&server), ClientRole::Trainer);
        Self {
            server,
            expected_pass_count,
            client,
            params: Vec::new(),
            batch_size: config.batch_size,
            controller: None,
        }
    }
}

impl ParameterUpdater for VRRemoteParameterUpdater {
    fn init(&mut self, params: &[Parameter]) -> Result<()> {
        for p in params {
            assert!(
                p.is_enabled(ParameterType::GradientSum)
                    && p.is_enabled(ParameterType::SnapshotValue),
                "parameter {} is missing svrg buffers",
                p.name()
            );
        }
        self.params = params.to_vec();
        self.client.set_parameter(&gather(params, ParameterType::Value))?;
        self.client.set_status(Status::ParameterReady);

        let server = Arc::clone(&self.server);
        let passes = self.expected_pass_count;
        self.controller = Some(thread::spawn(move || {
            let client = ParameterClient::new(server, ClientRole::Controller);
            vr_controller(&client, passes)
                .unwrap_or_else(|e| panic!("svrg controller failed: {e}"));
        }));
        Ok(())
    }

    fn start_pass(&mut self) {
        self.client.wait_pass_start();
    }

    fn finish_pass(&mut self, _cost: f64) -> Result<bool> {
        self.client.wait_pass_finish();
        let value = self.client.get_parameter()?;
        scatter(&self.params, ParameterType::Value, &value);
        Ok(true)
    }

    fn start_batch(&mut self, batch_size: usize) -> PassKind {
        self.batch_size = batch_size;
        PassKind::Train
    }

    fn finish_batch(&mut self, cost: f64) -> Result<()> {
        let grad = gather(&self.params, ParameterType::Gradient);
        let value = self.client.send_and_receive_parameter(
            UpdateMode::AddGradient,
            &grad,
            self.batch_size,
            cost as f32,
            true,
        )?;
        if let Some(value) = value {
            scatter(&self.params, ParameterType::Value, &value);
        }
        for p in &self.params {
            p.clear_gradient();
        }
        Ok(())
    }

    fn update(&mut self, _param: &Parameter) {
        // gradients ship in finish_batch, nothing to do per parameter
    }

    fn deinit(&mut self) {
        if let Some(handle) = self.controller.take() {
            if handle.join().is_err() {
                panic!("svrg controller panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pserver::ServerOptConfig;

    use super::*;

    fn parameter(name: &str, size: usize) -> Parameter {
        let mut p = Parameter::new(0, name, params::ParameterConfig::dense(size, 1));
        p.enable(ParameterType::Value);
        p.enable(ParameterType::Gradient);
        p.enable(ParameterType::GradientSum);
        p.enable(ParameterType::SnapshotValue);
        p
    }

    #[test]
    fn gather_and_scatter_are_inverse_over_two_parameters() {
        let a = parameter("w", 3);
        let b = parameter("b", 2);
        a.dense(ParameterType::Value).copy_from_slice(&[1.0, 2.0, 3.0]);
        b.dense(ParameterType::Value).copy_from_slice(&[4.0, 5.0]);

        let ps = [a, b];
        let flat = gather(&ps, ParameterType::Value);
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        scatter(&ps, ParameterType::Value, &[9.0, 8.0, 7.0, 6.0, 5.0]);
        assert_eq!(ps[0].dense(ParameterType::Value).to_vec(), vec![9.0, 8.0, 7.0]);
        assert_eq!(ps[1].dense(ParameterType::Value).to_vec(), vec![6.0, 5.0]);
    }

    #[test]
    #[should_panic(expected = "only drives svrg")]
    fn vr_updater_rejects_other_algorithms() {
        let server = Arc::new(ParameterServer::new(
            2,
            1,
            ServerOptConfig { learning_rate: 0.1 },
        ));
        let config = OptimizationConfig::default();
        let _ = VRRemoteParameterUpdater::new(server, &config, 1);
    }
}
