//! Transport Abstraction
//!
//! The message handlers never move bytes themselves. They submit fully
//! framed sends and capacity-bounded receives to a [`Transport`], then poll
//! it for completions. Any rank-addressed fabric that can report completion
//! by token fits behind this trait; [`LocalNetwork`] is the in-process one.

use crate::error::TransportResult;
use bytes::Bytes;
use ptp_codec::Rank;
use std::fmt;

pub mod local;


pub use local::{LocalNetwork, LocalOptions, LocalTransport};

/// Rank-addressed, completion-based transport.
///
/// One live endpoint per rank: per-channel sequence numbers are kept by the
/// handler owning the endpoint, so two senders sharing a rank would collide.
pub trait Transport: Send + Sync {
    /// Rank of this endpoint within the communication domain
    fn local_rank(&self) -> Rank;

    /// Submit a framed message (header ‖ payload) for delivery to `destination`.
    ///
    /// The transport copies what it needs before returning, so the caller's
    /// buffer may be recycled once the send completes.
    fn submit_send(&self, frame: &[u8], destination: Rank) -> TransportResult<TransportToken>;

    /// Submit a receive accepting any frame up to `capacity` bytes
    fn submit_receive(&self, capacity: usize) -> TransportResult<TransportToken>;

    /// Drain at most `max` completions. Never blocks.
    fn poll(&self, max: usize) -> Vec<TransportCompletion>;

    /// Withdraw a submitted operation if the transport has not committed it
    fn cancel(&self, token: TransportToken) -> CancelOutcome;

    /// Transport name for logging
    fn name(&self) -> &'static str {
        "transport"
    }
}

/// Opaque per-endpoint identifier of a submitted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportToken(pub u64);

impl fmt::Display for TransportToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// A finished transport operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCompletion {
    pub token: TransportToken,
    pub outcome: TransportOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    /// The frame left this endpoint
    Sent,
    /// A frame arrived for a posted receive
    Received(Bytes),
    /// A frame arrived but did not fit the posted receive. The receive
    /// completes with the leading bytes that did fit, so the sender's header
    /// can still be read.
    Oversized { len: usize, leading: Bytes },
    /// The operation failed inside the transport
    Failed(String),
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Withdrawn; no completion will be reported
    Cancelled,
    /// Already committed; its completion will still be reported
    NotSupported,
    /// Token is not outstanding (never issued or already reported)
    Unknown,
}
