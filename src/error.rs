//! Error types
//!
//! One error enum for the whole context; each variant is one of the
//! failure kinds an operation can surface.

use thiserror::Error;

/// Errors surfaced by [`crate::context::InferenceContext`] operations.
///
/// Cancellation is never an error: a cancelled generation run returns the
/// partial [`crate::generate::Completion`] with
/// [`crate::generate::StopReason::Cancelled`].
#[derive(Debug, Error)]
pub enum ContextError {
    /// Model file unreadable, malformed, or too large for memory.
    #[error("failed to load model: {0}")]
    Load(String),

    /// Malformed or missing chat template, or a role the template cannot render.
    #[error("chat template error: {0}")]
    Template(String),

    /// Prompt plus requested tokens would not fit the context window.
    #[error("context overflow: {needed} tokens needed, window is {limit}")]
    ContextOverflow { needed: usize, limit: usize },

    /// Another mutating operation is already running on this context.
    #[error("context is busy with another operation")]
    Busy,

    /// Runtime failure in the compute engine during generation.
    #[error("inference failed: {0}")]
    Inference(String),

    /// Session file is corrupt or carries an incompatible format version.
    #[error("incompatible session file: {0}")]
    SessionFormat(String),

    /// Generation or load parameters failed validation.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Operation requires a loaded model and the context has none.
    #[error("no model loaded")]
    NotLoaded,

    /// Filesystem access failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ContextError {
    /// True for errors that leave the context unusable (`Failed` state).
    pub fn is_fatal(&self) -> bool {
        matches!(self, ContextError::Load(_) | ContextError::Inference(_))
    }
}
