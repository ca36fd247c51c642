//! # Message Header
//!
//! Fixed-width metadata that precedes every payload on the wire. The layout
//! is described in [`crate::constants`]; encode and decode are exact
//! inverses for every header that passes validation.
//!
//! Decoding is strict: a short buffer, an unknown kind byte, or a payload size
//! above the configured limit are all rejected with [`HeaderError`] instead of
//! producing a partially valid header.

use crate::constants::*;
use crate::error::{HeaderError, HeaderResult};
use byteorder::{BigEndian, ByteOrder};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Peer identifier in the communication domain
pub type Rank = u32;

/// Application-chosen message classifier
pub type Tag = u32;

/// Message kind carried in the first header byte
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum MessageKind {
    /// Application payload
    Data = 0,
    /// Out-of-band coordination between handlers
    Control = 1,
    /// Receipt acknowledgement
    Ack = 2,
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Data
    }
}

/// Header describing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub tag: Tag,
    pub source: Rank,
    pub destination: Rank,
    /// Payload bytes following the header
    pub payload_size: u32,
    /// Position of this message within its (source, destination, tag) channel
    pub sequence: u32,
}

impl MessageHeader {
    /// Header size in bytes
    pub const SIZE: usize = HEADER_SIZE;

    /// Create a DATA header with no payload and sequence 0
    pub const fn new(source: Rank, destination: Rank, tag: Tag) -> Self {
        Self {
            kind: MessageKind::Data,
            tag,
            source,
            destination,
            payload_size: 0,
            sequence: 0,
        }
    }

    pub const fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub const fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub const fn with_payload_size(mut self, payload_size: u32) -> Self {
        self.payload_size = payload_size;
        self
    }

    /// Encode into a fresh fixed-size array
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        self.write_unchecked(&mut out);
        out
    }

    /// Encode into the first `HEADER_SIZE` bytes of `out`
    pub fn encode_into(&self, out: &mut [u8]) -> HeaderResult<()> {
        if out.len() < HEADER_SIZE {
            return Err(HeaderError::truncated(HEADER_SIZE, out.len(), "header encoding"));
        }
        self.write_unchecked(&mut out[..HEADER_SIZE]);
        Ok(())
    }

    fn write_unchecked(&self, out: &mut [u8]) {
        out[KIND_OFFSET] = self.kind.into();
        BigEndian::write_u32(&mut out[TAG_OFFSET..SOURCE_OFFSET], self.tag);
        BigEndian::write_u32(&mut out[SOURCE_OFFSET..DESTINATION_OFFSET], self.source);
        BigEndian::write_u32(
            &mut out[DESTINATION_OFFSET..PAYLOAD_SIZE_OFFSET],
            self.destination,
        );
        BigEndian::write_u32(
            &mut out[PAYLOAD_SIZE_OFFSET..SEQUENCE_OFFSET],
            self.payload_size,
        );
        BigEndian::write_u32(&mut out[SEQUENCE_OFFSET..HEADER_SIZE], self.sequence);
    }

    /// Decode a header from the start of `bytes`
    ///
    /// Trailing bytes beyond the header are ignored; use [`decode_frame`]
    /// when the payload must be checked as well.
    pub fn decode(bytes: &[u8], max_payload_size: u32) -> HeaderResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(HeaderError::truncated(
                HEADER_SIZE,
                bytes.len(),
                "header decoding",
            ));
        }

        let kind = MessageKind::try_from(bytes[KIND_OFFSET])
            .map_err(|_| HeaderError::unknown_kind(bytes[KIND_OFFSET]))?;

        let payload_size = BigEndian::read_u32(&bytes[PAYLOAD_SIZE_OFFSET..SEQUENCE_OFFSET]);
        if payload_size > max_payload_size {
            return Err(HeaderError::payload_too_large(payload_size, max_payload_size));
        }

        Ok(Self {
            kind,
            tag: BigEndian::read_u32(&bytes[TAG_OFFSET..SOURCE_OFFSET]),
            source: BigEndian::read_u32(&bytes[SOURCE_OFFSET..DESTINATION_OFFSET]),
            destination: BigEndian::read_u32(&bytes[DESTINATION_OFFSET..PAYLOAD_SIZE_OFFSET]),
            payload_size,
            sequence: BigEndian::read_u32(&bytes[SEQUENCE_OFFSET..HEADER_SIZE]),
        })
    }

    /// Total frame length (header plus payload)
    pub const fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_size as usize
    }
}

/// Decode a complete frame and split off its payload
///
/// Rejects frames whose body is shorter or longer than `payload_size`, which
/// is how partial arrivals and padded garbage are caught.
pub fn decode_frame(frame: &[u8], max_payload_size: u32) -> HeaderResult<(MessageHeader, &[u8])> {
    let header = MessageHeader::decode(frame, max_payload_size)?;
    let body = &frame[HEADER_SIZE..];
    if body.len() != header.payload_size as usize {
        return Err(HeaderError::length_mismatch(header.payload_size, body.len()));
    }
    Ok((header, body))
}
