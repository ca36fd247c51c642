//! Header decoding errors
//!
//! Every variant means the bytes on the wire cannot be trusted as a message
//! header. Callers treat them all the same way: drop the message, recycle the
//! buffer, keep going. The variants exist for diagnostics.

use thiserror::Error;

/// Malformed header or frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Fewer bytes than a full header
    #[error("Header truncated: need {need} bytes, got {got} (context: {context})")]
    Truncated {
        need: usize,
        got: usize,
        context: String,
    },

    /// Kind byte is not one of the known message kinds
    #[error("Unknown message kind {kind:#04x} (indicates: {diagnosis})")]
    UnknownKind { kind: u8, diagnosis: String },

    /// Declared payload exceeds the configured maximum message size
    #[error("Payload too large: header declares {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: u32, limit: u32 },

    /// Frame body length disagrees with the header's payload_size
    #[error("Frame length mismatch: header declares {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: u32, actual: usize },
}

/// Result alias for header operations
pub type HeaderResult<T> = std::result::Result<T, HeaderError>;

impl HeaderError {
    pub fn truncated(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::Truncated {
            need,
            got,
            context: context.into(),
        }
    }

    /// Create UnknownKind with a best-effort guess at what went wrong
    pub fn unknown_kind(kind: u8) -> Self {
        let diagnosis = match kind {
            0xFF => "corrupted buffer or uninitialized memory",
            0x03..=0x0F => "peer running a newer protocol revision",
            _ => "data corruption or misaligned frame",
        };

        Self::UnknownKind {
            kind,
            diagnosis: diagnosis.to_string(),
        }
    }

    pub const fn payload_too_large(size: u32, limit: u32) -> Self {
        Self::PayloadTooLarge { size, limit }
    }

    pub const fn length_mismatch(declared: u32, actual: usize) -> Self {
        Self::LengthMismatch { declared, actual }
    }

    /// Short category name for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            HeaderError::Truncated { .. } => "truncated",
            HeaderError::UnknownKind { .. } => "unknown_kind",
            HeaderError::PayloadTooLarge { .. } => "payload_too_large",
            HeaderError::LengthMismatch { .. } => "length_mismatch",
        }
    }
}
