//! Parameter storage: purpose-tagged value/gradient buffers shared
//! between a controller thread and its worker replicas.

mod buffer;
mod error;
mod parameter;

pub use buffer::{AtomicBuf, Buffer, DenseBuf, IntBuf, SparseRowBuf};
pub use error::{ParamError, Result};
pub use parameter::{NUM_PARAMETER_TYPES, Parameter, ParameterConfig, ParameterType};
