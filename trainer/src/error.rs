use std::{error::Error, fmt, io};

use pserver::PsError;

/// The trainer module's result type.
pub type Result<T> = std::result::Result<T, TrainerError>;

/// Trainer boundary failures. Configuration and numerical invariant
/// violations panic instead; see the updaters and the optimizer.
#[derive(Debug)]
pub enum TrainerError {
    /// A parameter-server call failed.
    Server(PsError),
    /// A configuration file could not be read.
    Io(io::Error),
    /// A configuration file could not be parsed.
    Json(serde_json::Error),
}

impl fmt::Display for TrainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainerError::Server(e) => write!(f, "parameter server: {e}"),
            TrainerError::Io(e) => write!(f, "config file: {e}"),
            TrainerError::Json(e) => write!(f, "config parse: {e}"),
        }
    }
}

impl Error for TrainerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainerError::Server(e) => Some(e),
            TrainerError::Io(e) => Some(e),
            TrainerError::Json(e) => Some(e),
        }
    }
}

impl From<PsError> for TrainerError {
    fn from(e: PsError) -> Self {
        TrainerError::Server(e)
    }
}

impl From<io::Error> for TrainerError {
    fn from(e: io::Error) -> Self {
        TrainerError::Io(e)
    }
}

impl From<serde_json::Error> for TrainerError {
    fn from(e: serde_json::Error) -> Self {
        TrainerError::Json(e)
    }
}
