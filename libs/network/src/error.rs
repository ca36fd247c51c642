//! Messaging Error Types
//!
//! Error handling for the buffer pool, the message handlers and the
//! transport seam.
//!
//! Three families, handled differently by callers:
//! - resource errors (`PoolExhausted`, transport back-pressure): retry later
//! - malformed wire data (`MalformedHeader`, `BufferOverflow` on receive):
//!   the message is dropped, its buffer recycled, progress continues
//! - contract violations (`DoubleRelease`, `ForeignBuffer`,
//!   `InvalidStateTransition`, `BufferBusy`): a caller bug, fatal to the
//!   offending call only

use crate::buffer::{BufferId, BufferState};
use crate::handler::OperationId;
use ptp_codec::{HeaderError, Rank};
use thiserror::Error;

/// Main messaging error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    /// No buffer could be handed out within the pool's limits
    #[error("Pool exhausted: {in_use} of {max} buffers in use ({context})")]
    PoolExhausted {
        in_use: usize,
        max: usize,
        context: String,
    },

    /// Buffer released while the pool does not consider it acquired
    #[error("Double release of buffer {buffer}: pool does not hold it as in use")]
    DoubleRelease { buffer: BufferId },

    /// Buffer released to a pool that did not allocate it
    #[error("Buffer {buffer} does not belong to pool {pool}")]
    ForeignBuffer { buffer: BufferId, pool: u64 },

    /// State change outside FREE → FILLING → IN_FLIGHT → COMPLETE → FREE
    #[error("Invalid state transition for buffer {buffer}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        buffer: BufferId,
        from: BufferState,
        to: BufferState,
    },

    /// Operation requires the buffer not to be in flight
    #[error("Buffer {buffer} is in flight")]
    BufferBusy { buffer: BufferId },

    /// Corrupt or adversarial header bytes
    #[error("Malformed header: {0}")]
    MalformedHeader(#[from] HeaderError),

    /// Staging would run past the buffer's capacity
    #[error("Buffer overflow: {requested} bytes on top of {staged} staged exceeds capacity {capacity}")]
    BufferOverflow {
        requested: usize,
        staged: usize,
        capacity: usize,
    },

    /// The transport already committed the operation
    #[error("Cancel not supported for {op}: {reason}")]
    CancelNotSupported { op: OperationId, reason: String },

    /// Operation id is not (or no longer) tracked by the handler
    #[error("Unknown operation {op}")]
    UnknownOperation { op: OperationId },

    /// Transport collaborator errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

/// Errors reported by a transport at submission time
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Back-pressure: the transport cannot accept the operation right now
    #[error("Transport would block")]
    WouldBlock,

    /// Destination rank is outside the communication domain
    #[error("Unknown rank {rank}")]
    UnknownRank { rank: Rank },

    /// Rank already has a live endpoint
    #[error("Rank {rank} already has a live endpoint")]
    RankInUse { rank: Rank },

    /// Transport has shut down
    #[error("Transport closed: {reason}")]
    Closed { reason: String },

    /// Operation failed inside the transport
    #[error("Transport operation failed: {message}")]
    Failed { message: String },
}

/// Result type alias for messaging operations
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Result type alias for transport submissions
pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl MessagingError {
    /// Create a pool exhausted error
    pub fn pool_exhausted(in_use: usize, max: usize, context: impl Into<String>) -> Self {
        Self::PoolExhausted {
            in_use,
            max,
            context: context.into(),
        }
    }

    pub const fn invalid_transition(buffer: BufferId, from: BufferState, to: BufferState) -> Self {
        Self::InvalidStateTransition { buffer, from, to }
    }

    pub const fn overflow(requested: usize, staged: usize, capacity: usize) -> Self {
        Self::BufferOverflow {
            requested,
            staged,
            capacity,
        }
    }

    pub fn cancel_not_supported(op: OperationId, reason: impl Into<String>) -> Self {
        Self::CancelNotSupported {
            op,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Check if retrying the same call later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            MessagingError::PoolExhausted { .. } => true,
            MessagingError::Transport(TransportError::WouldBlock) => true,
            _ => false,
        }
    }

    /// Check if this error indicates a bug in the caller
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            MessagingError::DoubleRelease { .. }
                | MessagingError::ForeignBuffer { .. }
                | MessagingError::InvalidStateTransition { .. }
                | MessagingError::BufferBusy { .. }
        )
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            MessagingError::PoolExhausted { .. } => "pool_exhausted",
            MessagingError::DoubleRelease { .. } => "double_release",
            MessagingError::ForeignBuffer { .. } => "foreign_buffer",
            MessagingError::InvalidStateTransition { .. } => "invalid_state_transition",
            MessagingError::BufferBusy { .. } => "buffer_busy",
            MessagingError::MalformedHeader(_) => "malformed_header",
            MessagingError::BufferOverflow { .. } => "buffer_overflow",
            MessagingError::CancelNotSupported { .. } => "cancel_not_supported",
            MessagingError::UnknownOperation { .. } => "unknown_operation",
            MessagingError::Transport(_) => "transport",
            MessagingError::Configuration { .. } => "configuration",
        }
    }
}

impl TransportError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_id() -> BufferId {
        BufferId { pool: 1, index: 3 }
    }

    #[test]
    fn test_error_construction() {
        let err = MessagingError::pool_exhausted(4, 4, "acquire");
        assert_eq!(err.category(), "pool_exhausted");
        assert!(err.is_retryable());
        assert!(!err.is_contract_violation());
        assert!(err.to_string().contains("4 of 4"));
    }

    #[test]
    fn test_contract_violations() {
        let violations = [
            MessagingError::DoubleRelease { buffer: buffer_id() },
            MessagingError::ForeignBuffer {
                buffer: buffer_id(),
                pool: 2,
            },
            MessagingError::invalid_transition(buffer_id(), BufferState::Free, BufferState::InFlight),
            MessagingError::BufferBusy { buffer: buffer_id() },
        ];
        for err in violations {
            assert!(err.is_contract_violation(), "{:?}", err);
            assert!(!err.is_retryable(), "{:?}", err);
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(MessagingError::from(TransportError::WouldBlock).is_retryable());
        assert!(!MessagingError::from(TransportError::UnknownRank { rank: 9 }).is_retryable());
        assert!(!MessagingError::overflow(10, 60, 64).is_retryable());
        assert!(!MessagingError::from(HeaderError::unknown_kind(9)).is_retryable());
    }

    #[test]
    fn test_header_error_conversion() {
        let err: MessagingError = HeaderError::truncated(21, 4, "test").into();
        match err {
            MessagingError::MalformedHeader(HeaderError::Truncated { got, .. }) => {
                assert_eq!(got, 4);
            }
            other => panic!("Expected MalformedHeader, got {:?}", other),
        }
    }

    #[test]
    fn test_display_includes_ids() {
        let text = MessagingError::UnknownOperation {
            op: OperationId::from_raw(17),
        }
        .to_string();
        assert!(text.contains("op#17"));

        let text = MessagingError::DoubleRelease { buffer: buffer_id() }.to_string();
        assert!(text.contains("1:3"));
    }
}
