//! Error types for the macro execution engine.
//!
//! This module defines the primary error type, `MacroError`, for the whole
//! engine. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure modes of a macro session.
//!
//! ## Error families
//!
//! - **Definition errors** (`UnknownMacro`, `UnknownMacroLibrary`): the
//!   requested macro or library is not registered. These are raised at
//!   submission time, before any side effect.
//! - **Parameter errors** (`MissingParam`, `WrongParam`, `UnknownParamObj`,
//!   `WrongParamType`): raw parameter tokens did not decode against the
//!   macro's parameter schema. Also raised at submission time.
//! - **Environment errors** (`MissingEnv`): a macro declared a required
//!   environment key that is absent. Raised during prepare, before the macro
//!   starts running.
//! - **Interruptions** (`Aborted`, `Stopped`): cancellation is modeled as an
//!   error value propagated with `?` from every suspension point, never as an
//!   out-of-band unwind. The executor maps these to terminal status events.
//! - **Runtime failures** (`Failed`): an error raised by macro code itself,
//!   carried as a structured [`ErrorRecord`] so it can be forwarded to
//!   clients as an exception status.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type MacroResult<T> = std::result::Result<T, MacroError>;

/// Primary error type of the engine.
#[derive(Error, Debug)]
pub enum MacroError {
    /// The requested macro is not registered.
    #[error("Unknown macro '{0}'")]
    UnknownMacro(String),

    /// The requested macro library is not registered.
    #[error("Unknown macro library '{0}'")]
    UnknownMacroLibrary(String),

    /// Tokens ran out before a mandatory parameter was satisfied.
    #[error("Missing parameter: {0}")]
    MissingParam(String),

    /// Tokens did not match the parameter schema.
    #[error("Wrong parameter: {0}")]
    WrongParam(String),

    /// An element-typed token named no registered element.
    #[error("Unknown parameter object: {0}")]
    UnknownParamObj(String),

    /// A token failed to parse as its declared type.
    #[error("Wrong parameter type: {0}")]
    WrongParamType(String),

    /// A declared required environment key is absent.
    #[error("Missing environment key '{0}'")]
    MissingEnv(String),

    /// The macro was interrupted immediately.
    #[error("Macro aborted: {0}")]
    Aborted(String),

    /// The macro was interrupted gracefully.
    #[error("Macro stopped: {0}")]
    Stopped(String),

    /// The macro code itself raised an error.
    #[error("Macro failed: {0}")]
    Failed(ErrorRecord),

    /// An operation was requested in a state that does not allow it.
    #[error("Invalid executor state: {0}")]
    InvalidState(String),

    /// Settings failed to load or validate.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session worker is gone.
    #[error("Session closed")]
    SessionClosed,
}

impl MacroError {
    /// Build a runtime failure from any error-like value, keeping the
    /// rendered message in a forwardable envelope.
    pub fn failed(exc_type: impl Into<String>, message: impl Into<String>) -> Self {
        MacroError::Failed(ErrorRecord::new(exc_type, message))
    }

    /// True for the two cancellation variants.
    pub fn is_interruption(&self) -> bool {
        matches!(self, MacroError::Aborted(_) | MacroError::Stopped(_))
    }

    /// Render this error into the envelope forwarded to clients.
    pub fn to_record(&self) -> ErrorRecord {
        match self {
            MacroError::Failed(rec) => rec.clone(),
            other => ErrorRecord::new(variant_name(other), other.to_string()),
        }
    }
}

fn variant_name(err: &MacroError) -> &'static str {
    match err {
        MacroError::UnknownMacro(_) => "UnknownMacro",
        MacroError::UnknownMacroLibrary(_) => "UnknownMacroLibrary",
        MacroError::MissingParam(_) => "MissingParam",
        MacroError::WrongParam(_) => "WrongParam",
        MacroError::UnknownParamObj(_) => "UnknownParamObj",
        MacroError::WrongParamType(_) => "WrongParamType",
        MacroError::MissingEnv(_) => "MissingEnv",
        MacroError::Aborted(_) => "Aborted",
        MacroError::Stopped(_) => "Stopped",
        MacroError::Failed(_) => "Failed",
        MacroError::InvalidState(_) => "InvalidState",
        MacroError::Config(_) => "Config",
        MacroError::SessionClosed => "SessionClosed",
    }
}

/// Structured envelope for an error raised inside a macro, suitable for
/// forwarding to clients alongside an exception status event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Short classification of the failure, e.g. the error variant name.
    pub exc_type: String,
    /// Human-readable message.
    pub message: String,
    /// Optional extra context lines (backtrace fragments, notes).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<String>,
}

impl ErrorRecord {
    /// Build a record from a type tag and a message.
    pub fn new(exc_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exc_type: exc_type.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    /// Attach context lines to the record.
    pub fn with_traceback(mut self, lines: Vec<String>) -> Self {
        self.traceback = lines;
        self
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.exc_type, self.message)
    }
}

impl From<anyhow::Error> for MacroError {
    fn from(err: anyhow::Error) -> Self {
        let mut traceback = Vec::new();
        for cause in err.chain().skip(1) {
            traceback.push(cause.to_string());
        }
        MacroError::Failed(ErrorRecord::new("Error", err.to_string()).with_traceback(traceback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MacroError::UnknownMacro("mv".to_string());
        assert_eq!(err.to_string(), "Unknown macro 'mv'");
    }

    #[test]
    fn test_interruption_classification() {
        assert!(MacroError::Aborted("user".into()).is_interruption());
        assert!(MacroError::Stopped("user".into()).is_interruption());
        assert!(!MacroError::MissingParam("motor".into()).is_interruption());
    }

    #[test]
    fn test_record_from_anyhow_chain() {
        let inner = anyhow::anyhow!("device timed out");
        let err: MacroError = inner.context("moving mot01").into();
        let rec = err.to_record();
        assert_eq!(rec.exc_type, "Error");
        assert_eq!(rec.message, "moving mot01");
        assert_eq!(rec.traceback, vec!["device timed out".to_string()]);
    }

    #[test]
    fn test_failed_record_roundtrip() {
        let err = MacroError::failed("ValueError", "bad position");
        let rec = err.to_record();
        assert_eq!(rec.exc_type, "ValueError");
        assert_eq!(rec.message, "bad position");
    }
}
