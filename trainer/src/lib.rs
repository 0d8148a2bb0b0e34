//! Training loops: the OWLQN batch optimizer, the SVRG
//! variance-reduced trainer, and the remote parameter updaters tying
//! gradient machines to the parameter server.

mod batch;
mod config;
mod error;
mod history;
mod internal;
mod owlqn;
mod stats;
mod updater;
mod vr;

pub use batch::OwlqnTrainer;
pub use config::{Algorithm, OptimizationConfig};
pub use error::{Result, TrainerError};
pub use internal::{TrainerInternalConfig, TrainerInternalVR};
pub use owlqn::Owlqn;
pub use stats::TrainerStats;
pub use updater::{BatchRemoteParameterUpdater, ParameterUpdater, VRRemoteParameterUpdater};
pub use vr::TrainerVR;
