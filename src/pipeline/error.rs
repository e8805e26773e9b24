//! Pipeline-specific error types.

use thiserror::Error;

/// Errors that can occur within the pipeline system.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown stage type: {0}")]
    UnknownStageType(String),

    #[error("Unknown connector type: {0}")]
    UnknownConnectorType(String),

    #[error("Stage {index} is invalid: {message}")]
    InvalidStage { index: usize, message: String },

    #[error("Pipeline '{0}' already exists")]
    DuplicateId(String),

    #[error("Pipeline '{0}' not found")]
    NotFound(String),

    #[error("Pipeline is malformed: {0}")]
    Malformed(String),

    #[error("Pipeline has been terminated")]
    Terminated,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Stage '{stage}' error: {message}")]
    Stage { stage: String, message: String },

    #[error("Representation error: {0}")]
    Representation(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Message exceeded {0} stage visits")]
    HopLimit(usize),

    #[error("Queue overflow (capacity {capacity})")]
    Overflow { capacity: usize },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Channel receive error")]
    ChannelRecv,
}

impl PipelineError {
    /// Build a stage processing error.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Whether this error belongs to the construction-time configuration class.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PipelineError::Config(_)
                | PipelineError::UnknownStageType(_)
                | PipelineError::UnknownConnectorType(_)
                | PipelineError::InvalidStage { .. }
                | PipelineError::DuplicateId(_)
        )
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
