//! Error handling for the msgbridge-rs application
//!
//! Pipeline-level failures live in [`crate::pipeline::error`]; this module
//! wraps them together with configuration and scripting errors for the
//! application layer.

use crate::pipeline::error::PipelineError;
use thiserror::Error;

/// Main error type for msgbridge-rs operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors raised by the pipeline engine
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to Rhai script compilation or execution
    #[error("Script error: {0}")]
    Script(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<BridgeError>,
    },
}

impl BridgeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        BridgeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a script error from a Rhai error
    pub fn from_rhai_error(err: Box<rhai::EvalAltResult>) -> Self {
        BridgeError::Script(err.to_string())
    }
}

/// Result type alias for msgbridge-rs operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, PipelineError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| BridgeError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| BridgeError::from(e).with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, Box<rhai::EvalAltResult>> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| BridgeError::from_rhai_error(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| BridgeError::from_rhai_error(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::Config("missing [runtime]".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing [runtime]");
    }

    #[test]
    fn test_error_with_context() {
        let err = BridgeError::Script("test".to_string());
        let with_ctx = err.with_context("Failed to compile");
        assert!(with_ctx.to_string().contains("Failed to compile"));
    }

    #[test]
    fn test_pipeline_error_context() {
        let result: std::result::Result<(), PipelineError> =
            Err(PipelineError::NotFound("cooler".to_string()));
        let err = result.context("starting pipelines").unwrap_err();
        assert!(err.to_string().starts_with("starting pipelines: "));
        assert!(err.to_string().contains("cooler"));
    }
}
