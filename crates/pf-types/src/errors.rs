use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::algo::Algo;

/// Main error type for the Paraforge system
#[derive(Error, Debug)]
pub enum PfError {
    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Which algorithms an override was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverrideScope {
    /// Every algorithm that has the field.
    All,
    /// A single algorithm.
    Algo(Algo),
}

impl std::fmt::Display for OverrideScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Algo(algo) => write!(f, "{algo}"),
        }
    }
}

/// Errors raised while building a parameter overlay
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OverlayError {
    #[error("Parameter not allowed in algo_parameters: {param}")]
    ParameterNotAllowed { param: String },

    #[error("Illegal value for algo_parameters.{param} (scope: {scope}): {value}")]
    InvalidValue {
        param: String,
        scope: OverrideScope,
        value: serde_json::Value,
    },

    #[error("Unknown parameter in algo_parameters.{param} (scope: {scope})")]
    UnknownParameter { param: String, scope: OverrideScope },
}

/// A value could not be assigned to an existing parameter field.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("field {field} expects {expected}: {message}")]
pub struct FieldTypeError {
    pub field: String,
    pub expected: &'static str,
    pub message: String,
}

/// Structured failure raised by a training runner
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrainingError {
    #[error("Training failed: {message}")]
    Failed { message: String },

    #[error("Invalid training parameters: {message}")]
    InvalidParameters { message: String },

    #[error("Training timeout: job ran longer than {seconds} seconds")]
    Timeout { seconds: f64 },

    #[error("Training task panicked: {message}")]
    Panicked { message: String },

    #[error("Training task cancelled")]
    Cancelled,
}

/// Dispatcher construction errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Dispatcher must be created inside a tokio runtime")]
    NoRuntime,
}

/// Result type alias for Paraforge operations
pub type PfResult<T> = Result<T, PfError>;

/// Helper trait for converting string errors
pub trait IntoPfError {
    fn into_pf_error(self) -> PfError;
}

impl IntoPfError for String {
    fn into_pf_error(self) -> PfError {
        PfError::Internal(self)
    }
}

impl IntoPfError for &str {
    fn into_pf_error(self) -> PfError {
        PfError::Internal(self.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::PfError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::PfError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::PfError::Config(format!($($arg)*))
    };
}
