//! Pooled Message Buffer
//!
//! A `MessageBuffer` is one reusable region of memory sized for a header plus
//! a bounded payload. It carries its own lifecycle state so misuse (staging
//! into an in-flight buffer, completing a free one) is rejected instead of
//! corrupting data.
//!
//! ```text
//! storage: [ header region (21 bytes) | payload region (capacity bytes) ]
//!
//! FREE ──stage/arm_receive──▶ FILLING ──mark_in_flight──▶ IN_FLIGHT
//!   ▲                                                        │
//!   └──────────── reset / release ◀── COMPLETE ◀─────────────┘
//! ```
//!
//! Buffers are only created by a [`MessageBufferPool`](crate::MessageBufferPool).
//! Dropping a buffer that was never released hands its storage back to the
//! owning pool, so an error path can never leak a pool slot.

use crate::error::{MessagingError, Result};
use crate::pool::PoolInner;
use ptp_codec::{decode_frame, MessageHeader, HEADER_SIZE};
use std::fmt;
use std::sync::Weak;

/// Identity of a buffer: the allocating pool plus a slot index within it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId {
    pub pool: u64,
    pub index: usize,
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool, self.index)
    }
}

/// Lifecycle state of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// In the pool, reusable
    Free,
    /// Owned by a caller, being staged or armed for a receive
    Filling,
    /// Handed to the transport; must not be mutated
    InFlight,
    /// Transport finished with it; contents readable until reset
    Complete,
}

/// Reusable header + payload buffer owned by exactly one party at a time
pub struct MessageBuffer {
    id: BufferId,
    storage: Box<[u8]>,
    header: Option<MessageHeader>,
    state: BufferState,
    /// Payload bytes staged (outbound) or received (inbound)
    len: usize,
    home: Weak<PoolInner>,
}

impl MessageBuffer {
    pub(crate) fn new(id: BufferId, capacity: usize, home: Weak<PoolInner>) -> Self {
        Self::from_storage(id, vec![0u8; HEADER_SIZE + capacity].into_boxed_slice(), home)
    }

    pub(crate) fn from_storage(id: BufferId, storage: Box<[u8]>, home: Weak<PoolInner>) -> Self {
        Self {
            id,
            storage,
            header: None,
            state: BufferState::Free,
            len: 0,
            home,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Payload capacity in bytes
    pub fn capacity(&self) -> usize {
        self.storage.len() - HEADER_SIZE
    }

    /// Payload bytes currently staged or received
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    /// Largest frame (header + payload) this buffer can hold
    pub fn frame_capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn header(&self) -> Option<&MessageHeader> {
        self.header.as_ref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.storage[HEADER_SIZE..HEADER_SIZE + self.len]
    }

    /// Header followed by payload, as handed to the transport.
    ///
    /// The header region is only written by [`mark_in_flight`](Self::mark_in_flight)
    /// and [`fill_from_wire`](Self::fill_from_wire); before that the first
    /// `HEADER_SIZE` bytes are stale.
    pub fn wire_bytes(&self) -> &[u8] {
        &self.storage[..HEADER_SIZE + self.len]
    }

    /// Clear contents and return to FREE. Rejected while in flight.
    pub fn reset(&mut self) -> Result<()> {
        if self.state == BufferState::InFlight {
            return Err(MessagingError::BufferBusy { buffer: self.id });
        }
        self.clear();
        Ok(())
    }

    /// Append `bytes` to the payload region and record `header`.
    ///
    /// The header's `payload_size` is overwritten with the total staged
    /// length. On overflow nothing is copied and the buffer is unchanged.
    pub fn stage(&mut self, bytes: &[u8], header: MessageHeader) -> Result<()> {
        match self.state {
            BufferState::Free | BufferState::Filling => {}
            other => {
                return Err(MessagingError::invalid_transition(
                    self.id,
                    other,
                    BufferState::Filling,
                ))
            }
        }
        if bytes.len() > self.remaining() {
            return Err(MessagingError::overflow(bytes.len(), self.len, self.capacity()));
        }

        let start = HEADER_SIZE + self.len;
        self.storage[start..start + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self.header = Some(header.with_payload_size(self.len as u32));
        self.state = BufferState::Filling;
        Ok(())
    }

    /// Prepare an empty buffer to receive a frame: FREE → FILLING
    pub fn arm_receive(&mut self) -> Result<()> {
        if self.state != BufferState::Free {
            return Err(MessagingError::invalid_transition(
                self.id,
                self.state,
                BufferState::Filling,
            ));
        }
        self.state = BufferState::Filling;
        Ok(())
    }

    /// FILLING → IN_FLIGHT. Encodes the staged header into the header region.
    pub fn mark_in_flight(&mut self) -> Result<()> {
        if self.state != BufferState::Filling {
            return Err(MessagingError::invalid_transition(
                self.id,
                self.state,
                BufferState::InFlight,
            ));
        }
        if let Some(header) = &self.header {
            header.encode_into(&mut self.storage[..HEADER_SIZE])?;
        }
        self.state = BufferState::InFlight;
        Ok(())
    }

    /// IN_FLIGHT → COMPLETE
    pub fn mark_complete(&mut self) -> Result<()> {
        if self.state != BufferState::InFlight {
            return Err(MessagingError::invalid_transition(
                self.id,
                self.state,
                BufferState::Complete,
            ));
        }
        self.state = BufferState::Complete;
        Ok(())
    }

    /// Copy a received frame in, decode its header and move to COMPLETE.
    ///
    /// Only valid for an in-flight receive. On any error the buffer stays
    /// IN_FLIGHT with no payload, so the caller decides whether to complete
    /// and recycle it.
    pub fn fill_from_wire(&mut self, frame: &[u8], max_payload_size: u32) -> Result<MessageHeader> {
        if self.state != BufferState::InFlight {
            return Err(MessagingError::invalid_transition(
                self.id,
                self.state,
                BufferState::Complete,
            ));
        }
        if frame.len() > self.storage.len() {
            return Err(MessagingError::overflow(
                frame.len().saturating_sub(HEADER_SIZE),
                0,
                self.capacity(),
            ));
        }

        self.storage[..frame.len()].copy_from_slice(frame);
        let (header, payload) = decode_frame(&self.storage[..frame.len()], max_payload_size)?;
        self.len = payload.len();
        self.header = Some(header);
        self.state = BufferState::Complete;
        Ok(header)
    }

    fn clear(&mut self) {
        self.header = None;
        self.len = 0;
        self.state = BufferState::Free;
    }

    /// Reset regardless of state. Used by the pool when reclaiming.
    pub(crate) fn force_free(&mut self) {
        self.clear();
    }

    /// Sever the link to the owning pool so dropping does not return storage
    pub(crate) fn detach(&mut self) {
        self.home = Weak::new();
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.home.upgrade() {
            let storage = std::mem::take(&mut self.storage);
            pool.reclaim_dropped(self.id, storage, self.state == BufferState::InFlight);
        }
    }
}

impl fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("header", &self.header)
            .finish()
    }
}
