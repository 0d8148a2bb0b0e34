use std::{error::Error, fmt};

/// The pserver module's result type.
pub type Result<T> = std::result::Result<T, PsError>;

/// Parameter-server protocol failures.
#[derive(Debug, PartialEq, Eq)]
pub enum PsError {
    /// A vector handle was released, never created, or is reserved.
    InvalidVector(u32),
    /// A payload length does not match the server dimension.
    DimMismatch { got: usize, expected: usize },
    /// A released reserved vector or similar handle misuse.
    ReservedVector(u32),
}

impl fmt::Display for PsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsError::InvalidVector(h) => write!(f, "invalid pserver vector handle {h}"),
            PsError::DimMismatch { got, expected } => {
                write!(f, "dimension mismatch: got {got}, expected {expected}")
            }
            PsError::ReservedVector(h) => {
                write!(f, "vector handle {h} is reserved and cannot be released")
            }
        }
    }
}

impl Error for PsError {}
