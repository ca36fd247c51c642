//! # Point-to-Point Messaging Network Layer
//!
//! Pooled message buffers and the handlers that move them over a
//! rank-addressed transport.
//!
//! ## Architecture
//!
//! ```text
//! PcMessageHandler   source/tag matching, unexpected queue, channel ordering
//!        │
//! MessageHandler     post_send / post_receive / poll_completions / cancel
//!        │      └──── MessageBufferPool ── MessageBuffer (header ‖ payload)
//! Transport          submit / poll / cancel by token (LocalNetwork in-process)
//! ```
//!
//! Progress is explicit: nothing happens in the background. A caller posts
//! operations, then polls; each poll drains the transport and returns owned
//! completions after every pooled buffer has gone back to its pool.
//!
//! ## Example
//!
//! ```rust
//! use ptp_config::{MessagingConfig, PoolConfig};
//! use ptp_network::{Completion, LocalNetwork, MessageHandler};
//!
//! let network = LocalNetwork::new(2);
//! let config = MessagingConfig::default().with_pool(PoolConfig::fixed(4, 64));
//! let sender = MessageHandler::with_config(network.endpoint(0).unwrap(), &config).unwrap();
//! let receiver = MessageHandler::with_config(network.endpoint(1).unwrap(), &config).unwrap();
//!
//! sender.post_send(b"hello", 1, 7).unwrap();
//! receiver.post_receive().unwrap();
//!
//! let received: Vec<_> = receiver.poll_completions().collect();
//! assert!(matches!(&received[..], [Completion::Received { payload, .. }] if payload.as_ref() == b"hello"));
//! ```

pub mod buffer;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod pc_handler;
pub mod pool;
pub mod transports;

pub use buffer::{BufferId, BufferState, MessageBuffer};
pub use error::{MessagingError, Result, TransportError, TransportResult};
pub use handler::{Completion, Completions, Handler, MessageHandler, OperationId, OperationState};
pub use metrics::{HandlerMetrics, HandlerMetricsSnapshot};
pub use pc_handler::{MatchCriterion, PcCompletion, PcMessageHandler, SourceMatch, TagMatch};
pub use pool::{MessageBufferPool, PoolStats};
pub use transports::{
    CancelOutcome, LocalNetwork, LocalOptions, LocalTransport, Transport, TransportCompletion,
    TransportOutcome, TransportToken,
};

pub use ptp_codec::{MessageHeader, MessageKind, Rank, Tag, HEADER_SIZE};
