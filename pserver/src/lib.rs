//! In-process parameter server and its client façade.
//!
//! All vector algebra the optimizers need is dispatched as batched
//! server-side operations, so an iterative algorithm costs one
//! round trip per op batch instead of pulling vectors client-side.

mod client;
mod error;
mod math;
mod ops;
mod server;
mod vector;

pub use client::{ClientRole, ParameterClient};
pub use error::{PsError, Result};
pub use ops::{Op, OpResults, PreparedOperations};
pub use server::{ParameterServer, ServerOptConfig, Status, UpdateMode};
pub use vector::PServerVector;
