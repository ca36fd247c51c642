//! # Point-to-Point Messaging Codec
//!
//! ## Purpose
//!
//! The wire layer of the messaging core: the fixed-width [`MessageHeader`]
//! that precedes every payload, its deterministic big-endian encoding, and
//! strict decoding that rejects anything a peer could not have produced.
//!
//! ## Architecture Role
//!
//! ```text
//! codec → [network: buffer / pool / handlers] → transport
//!   ↑                    ↓
//! Header layout     Frames = header ‖ payload
//! Validation        Opaque payload bytes
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Buffer management or pooling (belongs in network/)
//! - Transport logic of any kind
//! - Payload serialization (payloads are opaque bytes)

pub mod constants;
pub mod error;
pub mod header;

pub use constants::{DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
pub use error::{HeaderError, HeaderResult};
pub use header::{decode_frame, MessageHeader, MessageKind, Rank, Tag};
