//! Error types for the fusion pipeline
//!
//! Every fatal condition surfaces as a single [`ProcessorError`]. Alignment
//! uncertainty is never an error; it travels as a confidence flag instead.

use crate::types::PixelFormat;

/// Broad classification of a [`ProcessorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Bad input: empty frame list, mismatched dimensions, invalid config,
    /// reuse of a consumed state
    PreconditionViolation,
    /// A working buffer could not be obtained
    AllocationFailure,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProcessorError {
    #[error("No input frames provided")]
    EmptyInput,

    #[error("Insufficient frames: need {required}, got {provided}")]
    InsufficientFrames { required: usize, provided: usize },

    #[error(
        "Frame dimension mismatch: expected {}x{}, got {}x{}",
        expected.0, expected.1, got.0, got.1
    )]
    DimensionMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },

    #[error("Pixel format mismatch: expected {expected:?}, got {got:?}")]
    FormatMismatch {
        expected: PixelFormat,
        got: PixelFormat,
    },

    #[error("Frame data corruption: got {frame_size} bytes, expected {expected_size}")]
    DataCorruption {
        frame_size: usize,
        expected_size: usize,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("State already consumed: {0}")]
    StateConsumed(String),

    #[error("Failed to allocate {bytes} bytes for {purpose}")]
    AllocationFailed { bytes: usize, purpose: &'static str },
}

impl ProcessorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AllocationFailed { .. } => ErrorKind::AllocationFailure,
            _ => ErrorKind::PreconditionViolation,
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn consumed(what: impl Into<String>) -> Self {
        Self::StateConsumed(what.into())
    }
}

pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Allocate a working buffer of `len` copies of `fill`
///
/// Out-of-memory is reported as [`ProcessorError::AllocationFailed`] rather
/// than aborting the process.
pub(crate) fn try_buffer<T: Clone>(len: usize, fill: T, purpose: &'static str) -> Result<Vec<T>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| ProcessorError::AllocationFailed {
            bytes: len.saturating_mul(std::mem::size_of::<T>()),
            purpose,
        })?;
    buffer.resize(len, fill);
    Ok(buffer)
}
