//! Error taxonomy for model handles.
//!
//! Every failure surfaced to callers carries a [`ErrorKind`] so that an
//! outer layer (HTTP, CLI) can tell configuration problems apart from
//! transient resource problems without parsing messages.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;

/// Result alias used throughout the core.
pub type Result<T, E = HandleError> = std::result::Result<T, E>;

/// Coarse failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Load,
    NotReady,
    Generation,
    InvalidOverride,
    Timeout,
    Settings,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Load => "load",
            ErrorKind::NotReady => "not-ready",
            ErrorKind::Generation => "generation",
            ErrorKind::InvalidOverride => "invalid-override",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Settings => "settings",
        }
    }

    /// Whether retrying the same request later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::NotReady | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum HandleError {
    /// The logical name has no resolvable source.
    #[error("configuration error for '{name}': {message}")]
    Configuration { name: String, message: String },

    /// Artifacts were missing, corrupt or incompatible at load time.
    #[error("failed to load '{name}': {source}")]
    Load {
        name: String,
        #[source]
        source: BackendError,
    },

    /// Generation was requested before or during load.
    #[error("model '{name}' is not ready (state: {state})")]
    NotReady { name: String, state: String },

    /// Inference failed, including resource exhaustion after recovery.
    #[error("generation failed for '{name}': {source}")]
    Generation {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("invalid value for generation option '{key}': {reason}")]
    InvalidOverride { key: String, reason: String },

    #[error("generation for '{name}' timed out after {:.1}s", .after.as_secs_f64())]
    Timeout { name: String, after: Duration },

    #[error("settings error: {0}")]
    Settings(String),
}

impl HandleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandleError::Configuration { .. } => ErrorKind::Configuration,
            HandleError::Load { .. } => ErrorKind::Load,
            HandleError::NotReady { .. } => ErrorKind::NotReady,
            HandleError::Generation { .. } => ErrorKind::Generation,
            HandleError::InvalidOverride { .. } => ErrorKind::InvalidOverride,
            HandleError::Timeout { .. } => ErrorKind::Timeout,
            HandleError::Settings(_) => ErrorKind::Settings,
        }
    }

    pub(crate) fn configuration(name: &str, message: impl Into<String>) -> Self {
        HandleError::Configuration {
            name: name.to_string(),
            message: message.into(),
        }
    }
}
