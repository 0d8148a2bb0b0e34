use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Which optimizer drives the training loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Sgd,
    AsyncSgd,
    Owlqn,
    Svrg,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::Sgd => "sgd",
            Algorithm::AsyncSgd => "async_sgd",
            Algorithm::Owlqn => "owlqn",
            Algorithm::Svrg => "svrg",
        };
        f.write_str(name)
    }
}

/// Optimization settings, loadable from JSON.
///
/// Every field has a default so config files only name what they
/// change.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub algorithm: Algorithm,
    pub learning_rate: f32,
    /// Polynomial learning-rate decay `lr * (1 + a * samples)^(-b)`.
    pub decay_a: f32,
    pub decay_b: f32,
    pub momentum: f32,
    pub batch_size: usize,
    pub l1weight: f32,
    pub l2weight: f32,
    /// Accepted steps over which the l2 weight anneals linearly to
    /// zero; 0 keeps it constant.
    pub l2weight_zero_iter: u32,
    /// Sufficient-decrease constant of the weak Wolfe test.
    pub c1: f32,
    /// Line-search step multiplier on rejection.
    pub backoff: f32,
    /// Rejections in a row before a step is accepted regardless.
    pub max_backoff: u32,
    /// L-BFGS history length.
    pub owlqn_steps: usize,
    pub num_passes: usize,
    pub trainer_count: usize,
    pub log_period: usize,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Sgd,
            learning_rate: 0.01,
            decay_a: 0.0,
            decay_b: 0.0,
            momentum: 0.0,
            batch_size: 32,
            l1weight: 0.0,
            l2weight: 0.0,
            l2weight_zero_iter: 0,
            c1: 1e-4,
            backoff: 0.5,
            max_backoff: 5,
            owlqn_steps: 10,
            num_passes: 10,
            trainer_count: 1,
            log_period: 100,
        }
    }
}

impl OptimizationConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
