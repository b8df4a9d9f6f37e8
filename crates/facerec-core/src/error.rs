//! Error taxonomy shared by every facerec-core component.
//!
//! Failures raised inside a processing stage only carry a diagnostic string
//! ([`Error::Processing`]). Callers cannot tell stage failure causes apart
//! other than by inspecting the message.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("index {index} out of range (length {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate id: {0}")]
    DuplicateId(String),
    #[error("method mismatch: expected {expected}, found {found}")]
    MethodMismatch { expected: String, found: String },
    #[error("capacity exceeded: index holds at most {capacity} templates")]
    CapacityExceeded { capacity: usize },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),
    #[error("processing error: {0}")]
    Processing(String),
    #[error("corrupt data: {0}")]
    CorruptData(String),
    #[error("image must contain 1 face, found {found}")]
    FaceCount { found: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("{0} already released")]
    AlreadyReleased(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<crate::detector::DetectorError> for Error {
    fn from(err: crate::detector::DetectorError) -> Self {
        match err {
            crate::detector::DetectorError::ModelNotFound(path) => {
                Error::Config(format!("detector model file not found: {path}"))
            }
            other => Error::Processing(other.to_string()),
        }
    }
}

impl From<crate::recognizer::RecognizerError> for Error {
    fn from(err: crate::recognizer::RecognizerError) -> Self {
        match err {
            crate::recognizer::RecognizerError::ModelNotFound(path) => {
                Error::Config(format!("recognizer model file not found: {path}"))
            }
            other => Error::Processing(other.to_string()),
        }
    }
}
