//! Error types for dLLM block scheduling
//!
//! Buffer overflow is deliberately absent here: it is a state the scheduler
//! reads, not a failure.

use thiserror::Error;

use crate::engine::block::DllmBlockStatus;

/// Errors raised by the block scheduler
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DllmError {
    /// The configured algorithm identifier is not known
    #[error("Unknown dLLM algorithm: {0}")]
    UnknownAlgorithm(String),

    /// No block geometry is known for this model architecture
    #[error("Unknown diffusion LLM: {0}")]
    UnknownModel(String),

    /// Configuration values are unusable
    #[error("Invalid dLLM config: {0}")]
    InvalidConfig(String),

    /// The request is not in a state where this call makes sense
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Every slot of the buffer holds a valid block
    #[error("No dummy block left in buffer of request {req_id} (buffer size {buffer_size})")]
    CursorOutOfRange { req_id: u64, buffer_size: usize },

    /// A block status change not allowed by the block state machine
    #[error("Invalid block transition for block {block_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        block_id: usize,
        from: DllmBlockStatus,
        to: DllmBlockStatus,
    },

    /// No block with this id exists for the request
    #[error("Block {block_id} not found in request {req_id}")]
    BlockNotFound { req_id: u64, block_id: usize },
}

impl DllmError {
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, DllmError>;
