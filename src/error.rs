//! Error types for the segment vector subsystem
//!
//! This module provides structured error types using thiserror for better
//! error handling and actionable error messages. Validation problems with a
//! single vector live in [`VectorError`]; everything that can go wrong while
//! flushing, merging, opening or searching a segment is a [`SegmentError`].

use std::path::PathBuf;
use thiserror::Error;

use crate::vector::VectorError;

/// Main error type for segment-level operations
#[derive(Error, Debug)]
pub enum SegmentError {
    /// A vector, query or parameter violated the field contract
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] VectorError),

    /// On-disk data could not be decoded
    #[error("Segment data '{segment}' is corrupt: {reason}")]
    CorruptSegment { segment: String, reason: String },

    /// Capability not offered by vector fields
    #[error("Field [{field}] of type [{field_type}] doesn't support {operation}")]
    UnsupportedOperation {
        field: String,
        field_type: &'static str,
        operation: &'static str,
    },

    /// A caller-level timeout or shutdown interrupted the operation
    #[error("Operation '{operation}' was cancelled")]
    Cancelled { operation: &'static str },

    /// File system errors
    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration errors
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl SegmentError {
    /// Builds a `CorruptSegment` error from anything printable.
    pub fn corrupt(segment: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::CorruptSegment {
            segment: segment.to_string(),
            reason: reason.into(),
        }
    }

    /// Get a stable status code for this error type.
    pub fn status_code(&self) -> String {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::CorruptSegment { .. } => "CORRUPT_SEGMENT",
            Self::UnsupportedOperation { .. } => "UNSUPPORTED_OPERATION",
            Self::Cancelled { .. } => "CANCELLED",
            Self::FileRead { .. } => "FILE_READ_ERROR",
            Self::FileWrite { .. } => "FILE_WRITE_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::InvalidInput(_) => vec![
                "Fix the document or query; the request is rejected as a whole",
                "Check that the vector length matches the field's `dims`",
            ],
            Self::CorruptSegment { .. } => vec![
                "The flush or merge that produced this segment must be re-run",
                "Check for disk errors or filesystem corruption",
            ],
            Self::UnsupportedOperation { .. } => {
                vec!["Vector fields can only be used for scoring and ANN candidate queries"]
            }
            Self::Cancelled { .. } => vec!["Retry with a longer timeout"],
            Self::FileRead { .. } | Self::FileWrite { .. } => vec![
                "Check disk space and permissions in the index directory",
                "Ensure the segment files are not removed while in use",
            ],
            Self::Config { .. } => vec!["Check settings.toml and SEGVEC_* environment variables"],
        }
    }

    /// Whether the error describes bad caller input rather than bad data.
    #[must_use]
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}

/// Result type alias for segment operations
pub type SegmentResult<T> = Result<T, SegmentError>;
