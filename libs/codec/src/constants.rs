//! # Wire Constants
//!
//! Fixed values that define the header layout on the wire. These must stay
//! stable across peers: any change here is a wire-format break.
//!
//! ```text
//! offset  0        1        5        9        13              17        21
//!         [kind:1] [tag:4]  [src:4]  [dst:4]  [payload_size:4] [seq:4]
//! ```
//!
//! All multi-byte fields are big-endian (network order).

/// Encoded header width in bytes, identical for every message
pub const HEADER_SIZE: usize = 21;

pub const KIND_OFFSET: usize = 0;
pub const TAG_OFFSET: usize = 1;
pub const SOURCE_OFFSET: usize = 5;
pub const DESTINATION_OFFSET: usize = 9;
pub const PAYLOAD_SIZE_OFFSET: usize = 13;
pub const SEQUENCE_OFFSET: usize = 17;

/// Default upper bound on `payload_size` accepted by the decoder (1 MiB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

const _: () = assert!(SEQUENCE_OFFSET + 4 == HEADER_SIZE);
