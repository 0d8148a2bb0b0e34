use std::{error::Error, fmt};

/// The params module's result type.
pub type Result<T> = std::result::Result<T, ParamError>;

/// Parameter storage failures.
#[derive(Debug, PartialEq, Eq)]
pub enum ParamError {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
}

impl fmt::Display for ParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamError::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "size mismatch for {what}: got {got}, expected {expected}"
            ),
        }
    }
}

impl Error for ParamError {}
