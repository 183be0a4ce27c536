//! Error types for Pipeforge.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Pipeforge's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Pipeforge.
///
/// The enum is `Clone` on purpose: a single environment failure fans out as
/// the rejection of every pending request.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // =========================================================================
    // Protocol Errors (fatal to the controller instance)
    // =========================================================================
    #[error("Protocol violation: {0}")]
    Protocol(String),

    // =========================================================================
    // Environment Errors (trigger teardown)
    // =========================================================================
    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Environment unresponsive: {0}")]
    Unresponsive(String),

    #[error("Environment terminated: {0}")]
    Terminated(String),

    // =========================================================================
    // Request-Level Errors (reject exactly one request)
    // =========================================================================
    #[error("Script load failed: {0}")]
    ScriptLoad(String),

    #[error("Module not resolved: {0}")]
    ModuleNotResolved(String),

    #[error("Definition conflict: {0}")]
    DefinitionConflict(String),

    #[error("Export '{export}' of module '{module}' is not available")]
    ExportNotAvailable { module: String, export: String },

    #[error("Export '{export}' of module '{module}' is not callable")]
    NotCallable { module: String, export: String },

    #[error("Arity mismatch: function expects {expected} arguments, received {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("Unknown function pointer: {0}")]
    UnknownFunctionPointer(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // =========================================================================
    // Boundary Errors
    // =========================================================================
    /// An error rehydrated from the other side of the boundary. Only name and
    /// message survive the crossing.
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a protocol violation error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an environment error.
    pub fn environment(msg: impl Into<String>) -> Self {
        Self::Environment(msg.into())
    }

    /// Create an unresponsive-environment error.
    pub fn unresponsive(msg: impl Into<String>) -> Self {
        Self::Unresponsive(msg.into())
    }

    /// Create a terminated-environment error.
    pub fn terminated(msg: impl Into<String>) -> Self {
        Self::Terminated(msg.into())
    }

    /// Create a script load error.
    pub fn script_load(msg: impl Into<String>) -> Self {
        Self::ScriptLoad(msg.into())
    }

    /// Create a module-not-resolved error.
    pub fn module_not_resolved(msg: impl Into<String>) -> Self {
        Self::ModuleNotResolved(msg.into())
    }

    /// Create a definition conflict error.
    pub fn definition_conflict(msg: impl Into<String>) -> Self {
        Self::DefinitionConflict(msg.into())
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The stable name this error carries across the boundary.
    pub fn proxy_name(&self) -> &str {
        match self {
            Self::Protocol(_) => "ProtocolError",
            Self::Environment(_) => "EnvironmentError",
            Self::Unresponsive(_) => "UnresponsiveError",
            Self::Terminated(_) => "TerminatedError",
            Self::ScriptLoad(_) => "ScriptLoadError",
            Self::ModuleNotResolved(_) => "ModuleNotResolvedError",
            Self::DefinitionConflict(_) => "DefinitionConflictError",
            Self::ExportNotAvailable { .. } => "ExportNotAvailableError",
            Self::NotCallable { .. } => "NotCallableError",
            Self::ArityMismatch { .. } => "ArityMismatchError",
            Self::UnknownFunctionPointer(_) => "UnknownFunctionPointerError",
            Self::Timeout(_) => "TimeoutError",
            Self::Remote { name, .. } => name,
            Self::Validation(_) => "ValidationError",
            Self::InvalidRequest(_) => "InvalidRequestError",
            Self::Internal(_) => "InternalError",
        }
    }
}

/// Value-only snapshot of an error crossing the isolation boundary.
///
/// Carries name and message only: no backtrace, no cause chain. The boundary
/// is a pure data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorProxy {
    pub name: String,
    pub message: String,
}

impl ErrorProxy {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl From<&Error> for ErrorProxy {
    fn from(err: &Error) -> Self {
        let message = match err {
            Error::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            name: err.proxy_name().to_string(),
            message,
        }
    }
}

impl From<Error> for ErrorProxy {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

impl From<ErrorProxy> for Error {
    fn from(proxy: ErrorProxy) -> Self {
        Self::Remote {
            name: proxy.name,
            message: proxy.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_round_trip_preserves_name_and_message() {
        let proxy = ErrorProxy::new("Error", "bad key");
        let err = Error::from(proxy.clone());
        assert!(matches!(&err, Error::Remote { message, .. } if message == "bad key"));
        assert_eq!(ErrorProxy::from(&err), proxy);
    }

    #[test]
    fn arity_mismatch_maps_to_stable_proxy_name() {
        let err = Error::ArityMismatch {
            expected: 2,
            actual: 3,
        };
        let proxy = ErrorProxy::from(&err);
        assert_eq!(proxy.name, "ArityMismatchError");
        assert!(proxy.message.contains("expects 2"));
    }
}
