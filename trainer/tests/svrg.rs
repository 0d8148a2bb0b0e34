use std::sync::{Arc, Mutex};

use ndarray::Array2;
use rand::{Rng, SeedableRng, rngs::StdRng};

use machines::{DataBatch, InMemoryDataProvider, LinearNetwork, PassKind};
use params::{Parameter, ParameterConfig, ParameterType};
use pserver::{ParameterServer, ServerOptConfig};
use trainer::{
    Algorithm, OptimizationConfig, ParameterUpdater, TrainerInternalConfig, TrainerInternalVR,
    TrainerVR, VRRemoteParameterUpdater,
};

fn svrg_network(init: &[f32]) -> LinearNetwork {
    let mut p = Parameter::new(0, "w", ParameterConfig::dense(init.len(), 1));
    p.enable(ParameterType::Value);
    p.enable(ParameterType::Gradient);
    p.enable(ParameterType::GradientSum);
    p.enable(ParameterType::SnapshotValue);
    p.dense(ParameterType::Value).copy_from_slice(init);
    LinearNetwork::from_parameter(p)
}

fn random_data(samples: usize, w_true: &[f32], seed: u64) -> (Array2<f32>, Array2<f32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let inputs =
        Array2::from_shape_fn((samples, w_true.len()), |_| rng.random_range(-1.0f32..1.0));
    let targets = Array2::from_shape_fn((samples, 1), |(i, _)| {
        (0..w_true.len()).map(|j| inputs[(i, j)] * w_true[j]).sum()
    });
    (inputs, targets)
}

/// Closed-form least-squares gradient of the summed objective.
fn lsq_grad(inputs: &Array2<f32>, targets: &Array2<f32>, w: &[f32]) -> Vec<f32> {
    let w = Array2::from_shape_vec((w.len(), 1), w.to_vec()).unwrap();
    let residual = inputs.dot(&w) - targets;
    inputs.t().dot(&residual).iter().copied().collect()
}

/// Stand-in updater that records the gradient handed to the update
/// hook and otherwise stays out of the way.
struct RecordingUpdater {
    grads: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl ParameterUpdater for RecordingUpdater {
    fn init(&mut self, _params: &[Parameter]) -> trainer::Result<()> {
        Ok(())
    }

    fn start_pass(&mut self) {}

    fn finish_pass(&mut self, _cost: f64) -> trainer::Result<bool> {
        Ok(true)
    }

    fn start_batch(&mut self, _batch_size: usize) -> PassKind {
        PassKind::Train
    }

    fn finish_batch(&mut self, _cost: f64) -> trainer::Result<()> {
        Ok(())
    }

    fn update(&mut self, param: &Parameter) {
        self.grads
            .lock()
            .unwrap()
            .push(param.dense(ParameterType::Gradient).to_vec());
    }

    fn deinit(&mut self) {}
}

#[test]
fn anchor_gradient_accumulates_over_batches() {
    let w = [0.7f32, -0.3];
    let (inputs, targets) = random_data(4, &[1.0, 2.0], 11);
    let expected = lsq_grad(&inputs, &targets, &w);

    let network = svrg_network(&w);
    let grads = Arc::new(Mutex::new(Vec::new()));
    let mut internal = TrainerInternalVR::new(
        Box::new(network),
        Box::new(RecordingUpdater {
            grads: Arc::clone(&grads),
        }),
        TrainerInternalConfig {
            local: true,
            log_period: 100,
        },
    );
    internal.init().unwrap();

    // two batches in natural order, folded into the gradient sum
    for (batch_id, range) in [(0, 0..2), (1, 2..4)] {
        let batch = DataBatch::new(
            inputs.slice(ndarray::s![range.clone(), ..]).to_owned(),
            targets.slice(ndarray::s![range, ..]).to_owned(),
        );
        internal.calc_grad_one_batch(batch_id, &batch);
    }

    let anchor = internal.machine().parameters()[0]
        .dense(ParameterType::GradientSum)
        .to_vec();
    for (got, want) in anchor.iter().zip(&expected) {
        assert!((got - want).abs() < 1e-4, "{anchor:?} vs {expected:?}");
    }
    // per-batch gradients were consumed into the sum
    let leftover = internal.machine().parameters()[0]
        .dense(ParameterType::Gradient)
        .to_vec();
    assert!(leftover.iter().all(|g| *g == 0.0));
}

#[test]
fn batch_estimate_is_gradient_difference_between_points() {
    let w_t = [0.5f32, 1.0];
    let w_s = [-0.2f32, 0.4];
    let (inputs, targets) = random_data(3, &[1.0, -1.0], 23);
    let batch = DataBatch::new(inputs.clone(), targets.clone());

    let network = svrg_network(&w_t);
    network.parameter().dense(ParameterType::SnapshotValue).copy_from_slice(&w_s);

    let grads = Arc::new(Mutex::new(Vec::new()));
    let mut internal = TrainerInternalVR::new(
        Box::new(network),
        Box::new(RecordingUpdater {
            grads: Arc::clone(&grads),
        }),
        TrainerInternalConfig::default(),
    );
    internal.init().unwrap();
    internal.train_one_batch(0, &batch).unwrap();

    let g_t = lsq_grad(&inputs, &targets, &w_t);
    let g_s = lsq_grad(&inputs, &targets, &w_s);
    let recorded = grads.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    for ((got, gt), gs) in recorded[0].iter().zip(&g_t).zip(&g_s) {
        assert!((got - (gt - gs)).abs() < 1e-4);
    }

    // the double swap left both points where they were
    let p = &internal.machine().parameters()[0];
    assert_eq!(p.dense(ParameterType::Value).to_vec(), w_t.to_vec());
    assert_eq!(p.dense(ParameterType::SnapshotValue).to_vec(), w_s.to_vec());
}

#[test]
fn remote_svrg_converges_on_least_squares() {
    let w_true = [1.5f32, -2.0, 0.5];
    let (inputs, targets) = random_data(64, &w_true, 7);
    let provider = Arc::new(InMemoryDataProvider::new(inputs, targets));

    let config = OptimizationConfig {
        algorithm: Algorithm::Svrg,
        learning_rate: 0.005,
        batch_size: 8,
        num_passes: 10,
        ..OptimizationConfig::default()
    };
    let server = Arc::new(ParameterServer::new(
        w_true.len(),
        1,
        ServerOptConfig {
            learning_rate: config.learning_rate,
        },
    ));
    let updater = VRRemoteParameterUpdater::new(Arc::clone(&server), &config, config.num_passes);

    let mut internal = TrainerInternalVR::new(
        Box::new(svrg_network(&[0.0; 3])),
        Box::new(updater),
        TrainerInternalConfig::default(),
    );
    internal.init().unwrap();

    let mut trainer = TrainerVR::new(internal, provider, config.batch_size);
    trainer.train(config.num_passes).unwrap();
    trainer.internal_mut().updater_mut().deinit();

    let value = trainer.internal().machine().parameters()[0]
        .dense(ParameterType::Value)
        .to_vec();
    for (got, want) in value.iter().zip(&w_true) {
        assert!((got - want).abs() < 2e-2, "{value:?} vs {w_true:?}");
    }
}
