//! Point-to-Point Message Handler
//!
//! Adds matched receives on top of [`MessageHandler`]: a receive names the
//! peer and tag it wants (either may be a wildcard) and is completed only by a
//! message satisfying both.
//!
//! ## Matching
//!
//! ```text
//! arrival ──▶ sequence check per (source, tag)
//!               ├─ ahead of expected ──▶ reorder stash (until the gap closes or is released)
//!               ├─ behind expected ────▶ dropped as a stale duplicate
//!               └─ expected ──▶ first posted receive that matches ──▶ Delivered
//!                                 └─ none ──▶ unexpected queue (buffer parked)
//!
//! post_receive ──▶ earliest unexpected arrival that matches ──▶ Delivered
//!                   └─ none ──▶ posted list (posting order)
//! ```
//!
//! Messages on one `(source, destination, tag)` channel are delivered in the
//! order they were sent even when the transport reorders them. Nothing is
//! promised across channels.
//!
//! A frame that arrives but cannot be delivered (oversized, truncated,
//! malformed payload) still consumes its sequence number when its header
//! decodes. A frame that never arrives leaves a gap: the stash is released
//! past it after `max_gap_polls` polls without progress on the channel, or at
//! once when stashed arrivals hold every buffer the pool has.
//!
//! Base receives are kept outstanding so arrivals keep draining off the
//! transport: at least one per waiting matched receive, and at least
//! `prepost_receives` overall. Parked messages hold their pooled buffer, so
//! the pool bounds how much unexpected traffic can be absorbed.

use crate::buffer::MessageBuffer;
use crate::error::{MessagingError, Result};
use crate::handler::{Handler, MessageHandler, OperationId, RawCompletion};
use crate::transports::Transport;
use bytes::Bytes;
use parking_lot::Mutex;
use ptp_codec::{HeaderError, MessageHeader, MessageKind, Rank, Tag};
use ptp_config::{MatchingConfig, MessagingConfig};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, trace, warn};

/// Which senders a receive accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceMatch {
    Any,
    Rank(Rank),
}

/// Which tags a receive accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagMatch {
    Any,
    Tag(Tag),
}

impl From<Rank> for SourceMatch {
    fn from(rank: Rank) -> Self {
        SourceMatch::Rank(rank)
    }
}

impl From<Tag> for TagMatch {
    fn from(tag: Tag) -> Self {
        TagMatch::Tag(tag)
    }
}

/// Source and tag constraints of a posted receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchCriterion {
    pub source: SourceMatch,
    pub tag: TagMatch,
}

impl MatchCriterion {
    pub fn new(source: impl Into<SourceMatch>, tag: impl Into<TagMatch>) -> Self {
        Self {
            source: source.into(),
            tag: tag.into(),
        }
    }

    pub const fn any() -> Self {
        Self {
            source: SourceMatch::Any,
            tag: TagMatch::Any,
        }
    }

    pub fn matches(&self, header: &MessageHeader) -> bool {
        let source_ok = match self.source {
            SourceMatch::Any => true,
            SourceMatch::Rank(rank) => header.source == rank,
        };
        let tag_ok = match self.tag {
            TagMatch::Any => true,
            TagMatch::Tag(tag) => header.tag == tag,
        };
        source_ok && tag_ok
    }
}

/// Outcome reported by [`PcMessageHandler::poll_completions`]
#[derive(Debug, Clone, PartialEq)]
pub enum PcCompletion {
    /// A matched receive was satisfied
    Delivered {
        op: OperationId,
        header: MessageHeader,
        payload: Bytes,
    },
    Sent {
        op: OperationId,
        header: MessageHeader,
    },
    /// A send failed
    Failed {
        op: OperationId,
        error: MessagingError,
    },
    Cancelled {
        op: OperationId,
    },
    /// An arrival was dropped because its header could not be trusted
    Malformed { error: HeaderError },
    /// Receiving is impaired (transport failure on a receive, or no buffer
    /// left to keep a receive posted); matched receives stay pending
    Error { error: MessagingError },
}

impl PcCompletion {
    pub fn op(&self) -> Option<OperationId> {
        match self {
            PcCompletion::Delivered { op, .. }
            | PcCompletion::Sent { op, .. }
            | PcCompletion::Failed { op, .. }
            | PcCompletion::Cancelled { op } => Some(*op),
            PcCompletion::Malformed { .. } | PcCompletion::Error { .. } => None,
        }
    }
}

struct Parked {
    header: MessageHeader,
    buffer: MessageBuffer,
}

enum Slot {
    Arrived(Parked),
    /// Sequence number used by an arrival that could not be delivered
    Lost,
}

/// `sequence` is at or behind `expected`, allowing for wrap-around
fn is_stale(sequence: u32, expected: u32) -> bool {
    sequence.wrapping_sub(expected) > u32::MAX / 2
}

#[derive(Default)]
struct MatchState {
    /// Matched receives in posting order
    posted: VecDeque<(OperationId, MatchCriterion)>,
    /// In-order arrivals nobody asked for yet, oldest first
    unexpected: VecDeque<Parked>,
    /// Next sequence number expected per (source, tag)
    expected: HashMap<(Rank, Tag), u32>,
    /// Arrivals that overtook an earlier message on their channel
    reorder: HashMap<(Rank, Tag), BTreeMap<u32, Slot>>,
    /// Polls since each stashed channel last made progress
    gap_polls: HashMap<(Rank, Tag), usize>,
    /// Base receives currently posted on the transport
    base_receives: HashSet<OperationId>,
    /// Completions produced outside a poll (immediate matches, cancels)
    ready: VecDeque<PcCompletion>,
}

/// Point-to-point handler with source/tag matched receives
pub struct PcMessageHandler {
    base: MessageHandler,
    prepost: usize,
    max_gap_polls: usize,
    state: Mutex<MatchState>,
}

impl PcMessageHandler {
    /// Wrap `base`, posting the configured number of base receives
    pub fn new(base: MessageHandler, matching: &MatchingConfig) -> Result<Self> {
        let handler = Self {
            base,
            prepost: matching.prepost_receives,
            max_gap_polls: matching.max_gap_polls.max(1),
            state: Mutex::new(MatchState::default()),
        };
        {
            let mut state = handler.state.lock();
            handler.replenish(&mut state)?;
        }
        debug!(
            rank = handler.base.rank(),
            prepost = handler.prepost,
            "Created point-to-point handler"
        );
        Ok(handler)
    }

    pub fn with_config(transport: impl Transport + 'static, config: &MessagingConfig) -> Result<Self> {
        Self::new(MessageHandler::with_config(transport, config)?, &config.matching)
    }

    pub fn base(&self) -> &MessageHandler {
        &self.base
    }

    pub fn rank(&self) -> Rank {
        self.base.rank()
    }

    pub fn post_send(&self, payload: &[u8], destination: Rank, tag: Tag) -> Result<OperationId> {
        self.base.post_send(payload, destination, tag)
    }

    pub fn post_message(
        &self,
        payload: &[u8],
        destination: Rank,
        tag: Tag,
        kind: MessageKind,
    ) -> Result<OperationId> {
        self.base.post_message(payload, destination, tag, kind)
    }

    /// Post a receive for the next message from `source` with `tag`.
    ///
    /// An already-arrived unexpected message that matches completes the
    /// receive immediately (reported by the next poll). Fails with
    /// `PoolExhausted` when no buffer is left to receive into and nothing is
    /// outstanding that could ever satisfy it.
    pub fn post_receive(
        &self,
        source: impl Into<SourceMatch>,
        tag: impl Into<TagMatch>,
    ) -> Result<OperationId> {
        let criterion = MatchCriterion::new(source, tag);
        let op = self.base.allocate_operation_id();
        let mut state = self.state.lock();

        if let Some(position) = state
            .unexpected
            .iter()
            .position(|parked| criterion.matches(&parked.header))
        {
            if let Some(parked) = state.unexpected.remove(position) {
                trace!(%op, source = parked.header.source, tag = parked.header.tag, "Receive matched unexpected message");
                let delivered = self.deliver(op, parked);
                state.ready.push_back(delivered);
                return Ok(op);
            }
        }

        state.posted.push_back((op, criterion));
        if let Err(error) = self.replenish(&mut state) {
            if state.base_receives.is_empty() {
                state.posted.retain(|(posted, _)| *posted != op);
                return Err(error);
            }
            debug!(%op, %error, "Receive posted without an extra base receive");
        }
        trace!(%op, ?criterion, "Receive posted");
        Ok(op)
    }

    /// Cancel a posted matched receive or a send
    pub fn cancel(&self, op: OperationId) -> Result<()> {
        {
            let mut state = self.state.lock();
            if let Some(position) = state.posted.iter().position(|(posted, _)| *posted == op) {
                state.posted.remove(position);
                state.ready.push_back(PcCompletion::Cancelled { op });
                debug!(%op, "Matched receive cancelled");
                return Ok(());
            }
        }
        self.base.cancel(op)
    }

    /// Drive progress and return everything that completed since the last poll
    pub fn poll_completions(&self) -> std::vec::IntoIter<PcCompletion> {
        let mut out: Vec<PcCompletion> = self.state.lock().ready.drain(..).collect();

        for raw in self.base.poll_raw() {
            let mut state = self.state.lock();
            self.on_raw(&mut state, raw, &mut out);
        }

        let mut state = self.state.lock();
        self.age_gaps(&mut state, &mut out);
        let mut replenished = self.replenish(&mut state);
        if replenished.is_err() && state.base_receives.is_empty() && !state.reorder.is_empty() {
            warn!(
                stashed = state.reorder.len(),
                "Out-of-order arrivals hold every receive buffer, releasing gaps"
            );
            let channels: Vec<_> = state.reorder.keys().copied().collect();
            for channel in channels {
                self.release_gap(&mut state, channel, &mut out);
            }
            replenished = self.replenish(&mut state);
        }
        if let Err(error) = replenished {
            if state.base_receives.is_empty() {
                warn!(%error, "No receive left posted");
                out.push(PcCompletion::Error { error });
            } else {
                debug!(%error, "Running with fewer base receives than wanted");
            }
        }
        out.into_iter()
    }

    /// Arrivals parked because no posted receive matched them
    pub fn unexpected_count(&self) -> usize {
        self.state.lock().unexpected.len()
    }

    /// Matched receives still waiting for a message
    pub fn pending_receive_count(&self) -> usize {
        self.state.lock().posted.len()
    }

    /// Arrivals held back until an earlier message on their channel shows up
    pub fn reorder_count(&self) -> usize {
        self.state
            .lock()
            .reorder
            .values()
            .flat_map(BTreeMap::values)
            .filter(|slot| matches!(slot, Slot::Arrived(_)))
            .count()
    }

    fn replenish(&self, state: &mut MatchState) -> Result<()> {
        let target = state.posted.len().max(self.prepost);
        while state.base_receives.len() < target {
            let op = self.base.try_post_receive()?;
            state.base_receives.insert(op);
        }
        Ok(())
    }

    fn on_raw(&self, state: &mut MatchState, raw: RawCompletion, out: &mut Vec<PcCompletion>) {
        match raw {
            RawCompletion::Sent { op, header, buffer } => {
                self.base.recycle(buffer);
                out.push(PcCompletion::Sent { op, header });
            }
            RawCompletion::Received { op, header, buffer } => {
                state.base_receives.remove(&op);
                self.on_arrival(state, Parked { header, buffer }, out);
            }
            RawCompletion::Malformed {
                op,
                error,
                lost,
                buffer,
            } => {
                state.base_receives.remove(&op);
                self.base.recycle(buffer);
                out.push(PcCompletion::Malformed { error });
                if let Some(header) = lost {
                    self.skip(state, header, out);
                }
            }
            RawCompletion::Failed {
                op,
                error,
                lost,
                buffer,
            } => {
                self.base.recycle(buffer);
                if state.base_receives.remove(&op) {
                    out.push(PcCompletion::Error { error });
                    if let Some(header) = lost {
                        self.skip(state, header, out);
                    }
                } else {
                    out.push(PcCompletion::Failed { op, error });
                }
            }
            RawCompletion::Cancelled { op, buffer } => {
                self.base.recycle(buffer);
                if !state.base_receives.remove(&op) {
                    out.push(PcCompletion::Cancelled { op });
                }
            }
        }
    }

    fn on_arrival(&self, state: &mut MatchState, parked: Parked, out: &mut Vec<PcCompletion>) {
        let header = parked.header;
        let channel = (header.source, header.tag);
        let expected = state.expected.get(&channel).copied().unwrap_or(0);

        if header.sequence == expected {
            self.accept(state, parked, out);
            self.advance(state, channel, expected.wrapping_add(1), out);
            return;
        }
        if is_stale(header.sequence, expected) {
            warn!(
                source = header.source,
                tag = header.tag,
                sequence = header.sequence,
                expected,
                "Dropping stale duplicate"
            );
            self.base.recycle(parked.buffer);
            return;
        }

        trace!(
            source = header.source,
            tag = header.tag,
            sequence = header.sequence,
            expected,
            "Arrival ahead of sequence, stashing"
        );
        let stash = state.reorder.entry(channel).or_default();
        if let Some(Slot::Arrived(duplicate)) = stash.insert(header.sequence, Slot::Arrived(parked)) {
            warn!(sequence = header.sequence, "Duplicate stashed arrival dropped");
            self.base.recycle(duplicate.buffer);
        }
    }

    /// Consume the sequence number of an arrival that will never be delivered
    fn skip(&self, state: &mut MatchState, header: MessageHeader, out: &mut Vec<PcCompletion>) {
        let channel = (header.source, header.tag);
        let expected = state.expected.get(&channel).copied().unwrap_or(0);

        if header.sequence == expected {
            debug!(
                source = header.source,
                tag = header.tag,
                sequence = header.sequence,
                "Skipping undeliverable sequence"
            );
            self.advance(state, channel, expected.wrapping_add(1), out);
        } else if !is_stale(header.sequence, expected) {
            state
                .reorder
                .entry(channel)
                .or_default()
                .entry(header.sequence)
                .or_insert(Slot::Lost);
        }
    }

    /// Expect `next` on `channel`, first draining stashed slots that are now in order
    fn advance(
        &self,
        state: &mut MatchState,
        channel: (Rank, Tag),
        mut next: u32,
        out: &mut Vec<PcCompletion>,
    ) {
        loop {
            match state
                .reorder
                .get_mut(&channel)
                .and_then(|stash| stash.remove(&next))
            {
                Some(Slot::Arrived(parked)) => self.accept(state, parked, out),
                Some(Slot::Lost) => trace!(sequence = next, "Passing undeliverable sequence"),
                None => break,
            }
            next = next.wrapping_add(1);
        }
        state.expected.insert(channel, next);
        state.gap_polls.remove(&channel);
        if state.reorder.get(&channel).is_some_and(BTreeMap::is_empty) {
            state.reorder.remove(&channel);
        }
    }

    /// Count a poll against every stashed channel and release the stale ones
    fn age_gaps(&self, state: &mut MatchState, out: &mut Vec<PcCompletion>) {
        let channels: Vec<_> = state.reorder.keys().copied().collect();
        for channel in channels {
            let polls = state.gap_polls.entry(channel).or_insert(0);
            *polls += 1;
            if *polls >= self.max_gap_polls {
                self.release_gap(state, channel, out);
            }
        }
    }

    /// Give up on the messages missing ahead of the channel's earliest stashed arrival
    fn release_gap(&self, state: &mut MatchState, channel: (Rank, Tag), out: &mut Vec<PcCompletion>) {
        let expected = state.expected.get(&channel).copied().unwrap_or(0);
        let earliest = state.reorder.get(&channel).and_then(|stash| {
            stash
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Arrived(_)))
                .map(|(sequence, _)| *sequence)
                .min_by_key(|sequence| sequence.wrapping_sub(expected))
        });

        let Some(sequence) = earliest else {
            state.reorder.remove(&channel);
            state.gap_polls.remove(&channel);
            return;
        };
        let offset = sequence.wrapping_sub(expected);
        warn!(
            source = channel.0,
            tag = channel.1,
            expected,
            resume_at = sequence,
            missing = offset,
            "Giving up on missing messages"
        );
        if let Some(stash) = state.reorder.get_mut(&channel) {
            stash.retain(|stashed, _| stashed.wrapping_sub(expected) >= offset);
        }
        self.advance(state, channel, sequence, out);
    }

    /// Hand an in-order arrival to the first matching posted receive, or park it
    fn accept(&self, state: &mut MatchState, parked: Parked, out: &mut Vec<PcCompletion>) {
        let position = state
            .posted
            .iter()
            .position(|(_, criterion)| criterion.matches(&parked.header));
        match position.and_then(|position| state.posted.remove(position)) {
            Some((op, _)) => out.push(self.deliver(op, parked)),
            None => {
                debug!(
                    source = parked.header.source,
                    tag = parked.header.tag,
                    "Parking unexpected message"
                );
                state.unexpected.push_back(parked);
            }
        }
    }

    fn deliver(&self, op: OperationId, parked: Parked) -> PcCompletion {
        let payload = Bytes::copy_from_slice(parked.buffer.payload());
        self.base.recycle(parked.buffer);
        PcCompletion::Delivered {
            op,
            header: parked.header,
            payload,
        }
    }
}

impl Handler for PcMessageHandler {
    type Completion = PcCompletion;
    type Completions<'a> = std::vec::IntoIter<PcCompletion>;

    fn post_send(&self, payload: &[u8], destination: Rank, tag: Tag) -> Result<OperationId> {
        PcMessageHandler::post_send(self, payload, destination, tag)
    }

    /// Receive from any source with any tag
    fn post_receive(&self) -> Result<OperationId> {
        PcMessageHandler::post_receive(self, SourceMatch::Any, TagMatch::Any)
    }

    fn poll_completions(&self) -> Self::Completions<'_> {
        PcMessageHandler::poll_completions(self)
    }

    fn cancel(&self, op: OperationId) -> Result<()> {
        PcMessageHandler::cancel(self, op)
    }
}
