//! Gradient machines: multi-threaded batch and async-SGD training over
//! shared parameters, plus the data providers that feed them.

mod asgd;
mod batch;
mod data;
mod linear;
mod machine;
mod sampler;

pub use asgd::{AsgdConfig, AsgdSparseGradientMachine};
pub use batch::{BatchConfig, BatchGradientMachine, PassStats};
pub use data::{DataBatch, DataProvider, InMemoryDataProvider};
pub use linear::LinearNetwork;
pub use machine::{GradientMachine, PassKind, ReplicaFactory, UpdateCallback};
pub use sampler::ImportanceSamplerWithoutReplacement;
