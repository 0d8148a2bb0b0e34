use std::{env, process, sync::Arc};

use log::{error, info};
use ndarray::Array2;
use rand::{Rng, SeedableRng, rngs::StdRng};

use machines::{InMemoryDataProvider, LinearNetwork};
use params::{Parameter, ParameterConfig, ParameterType};
use pserver::{ParameterServer, ServerOptConfig};
use trainer::{
    Algorithm, OptimizationConfig, Result, TrainerInternalConfig, TrainerInternalVR, TrainerVR,
    VRRemoteParameterUpdater,
};

/// Trains a least-squares model with SVRG against an in-process
/// parameter server. Pass a JSON config path to override the defaults.
fn main() {
    env_logger::init();
    if let Err(e) = run() {
        error!("training failed: {e}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = match env::args().nth(1) {
        Some(path) => OptimizationConfig::from_file(path)?,
        None => OptimizationConfig {
            algorithm: Algorithm::Svrg,
            // gradients are summed, not averaged, so the rate is small
            learning_rate: 0.002,
            batch_size: 8,
            num_passes: 8,
            log_period: 10,
            ..OptimizationConfig::default()
        },
    };
    info!(algorithm = config.algorithm.to_string().as_str(),
          num_passes = config.num_passes; "starting");

    let w_true = [1.5f32, -2.0, 0.5];
    let samples = 128;
    let mut rng = StdRng::seed_from_u64(7);
    let inputs = Array2::from_shape_fn((samples, w_true.len()), |_| rng.random_range(-1.0f32..1.0));
    let targets = Array2::from_shape_fn((samples, 1), |(i, _)| {
        (0..w_true.len()).map(|j| inputs[(i, j)] * w_true[j]).sum()
    });
    let provider = Arc::new(InMemoryDataProvider::new(inputs, targets));

    let mut weights = Parameter::new(0, "w", ParameterConfig::dense(w_true.len(), 1));
    weights.enable(ParameterType::Value);
    weights.enable(ParameterType::Gradient);
    weights.enable(ParameterType::GradientSum);
    weights.enable(ParameterType::SnapshotValue);
    let network = LinearNetwork::from_parameter(weights);

    let server = Arc::new(ParameterServer::new(
        w_true.len(),
        1,
        ServerOptConfig {
            learning_rate: config.learning_rate,
        },
    ));
    let updater = VRRemoteParameterUpdater::new(Arc::clone(&server), &config, config.num_passes);

    let mut internal = TrainerInternalVR::new(
        Box::new(network),
        Box::new(updater),
        TrainerInternalConfig {
            local: false,
            log_period: config.log_period,
        },
    );
    internal.init()?;

    let mut trainer = TrainerVR::new(internal, provider, config.batch_size);
    trainer.train(config.num_passes)?;
    trainer.internal_mut().updater_mut().deinit();

    let value = trainer.internal().machine().parameters()[0]
        .dense(ParameterType::Value)
        .to_vec();
    info!(final_avg_cost = trainer.internal().stats().avg_cost();
          "done, weights {:?} (target {:?})", value, w_true);
    Ok(())
}
