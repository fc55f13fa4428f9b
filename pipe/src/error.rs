use std::any::Any;
use std::fmt;
use thiserror::Error;

/// An item travelling between two stages
pub type AnyItem = Box<dyn Any + Send>;

/// Result type for pipe configuration and start-up
pub type Result<T> = std::result::Result<T, PipeError>;

/// Configuration and contract errors. All of them are raised before any
/// stage thread runs.
#[derive(Debug, Error)]
pub enum PipeError {
    /// The pipe has no stages
    #[error("pipe has no processors")]
    Empty,

    /// Two adjacent stages cannot be connected
    #[error("processors do not match: {upstream} emits {output}, {downstream} accepts {input}")]
    Mismatch {
        upstream: String,
        output: String,
        downstream: String,
        input: String,
    },

    /// A stage (or attached process) refused to start
    #[error("one of the processors ({stage}) failed to start: {reason}")]
    CannotStart { stage: String, reason: String },

    /// A declared context dependency is missing
    #[error("unsatisfied context parameter dependency in {stage} for parameter '{key}'")]
    MissingContext { stage: String, key: String },

    /// A context value exists but has another type than declared
    #[error("context parameter type mismatch for '{key}': required {required}, supplied {supplied}")]
    ContextType {
        key: String,
        required: &'static str,
        supplied: &'static str,
    },

    /// A stage tried to publish a key some other stage already published
    #[error("can't overwrite context parameter '{key}' at initialization")]
    ContextCollision { key: String },

    /// A processor parameter is missing or cannot be converted
    #[error("parameter '{name}': {reason}")]
    Param { name: String, reason: String },

    /// Stage-specific initialization failure
    #[error("{stage} initialization failed: {reason}")]
    Init { stage: String, reason: String },

    /// `start` was called twice
    #[error("pipe was already started")]
    AlreadyStarted,

    /// The OS refused to spawn a stage thread
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl PipeError {
    /// Create an Init error
    pub fn init(stage: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Init {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a Param error
    pub fn param(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Param {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Stoppage signal raised by blocking channel I/O.
///
/// Not a failure: a neighbour has terminated and the stage should shut down
/// in an orderly way.
#[derive(Debug, Error)]
pub enum Interrupt {
    /// The upstream stage is `Stopped` and its buffer is drained
    #[error("upstream processor stopped")]
    UpstreamGone,

    /// The downstream stage is `Stopped`; carries the item that could not be
    /// delivered
    #[error("downstream processor stopped")]
    DownstreamGone(AnyItem),
}
