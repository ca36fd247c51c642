//! Message Handler
//!
//! Drives the send/receive lifecycle of pooled buffers over a [`Transport`].
//!
//! ```text
//! post_send:    acquire → stage → [pending queue] → stamp sequence → IN_FLIGHT → submit
//! post_receive: acquire → arm → IN_FLIGHT → submit
//! poll:         flush pending sends → drain transport → per completion:
//!               decode / complete → yield owned value → release buffer
//! ```
//!
//! Every operation gets an [`OperationId`]. Outstanding operations live in a
//! concurrent map keyed by id, with a second map from transport token back to
//! id, so posting from one thread and polling from another needs no global
//! handler lock. The only serialized path is send submission, which keeps
//! per-channel sequence numbers in submission order.
//!
//! Sequence numbers are stamped when a frame is actually handed to the
//! transport. A send that is queued by back-pressure and then cancelled never
//! consumed a number, so receivers never wait on a gap.

use crate::buffer::{BufferState, MessageBuffer};
use crate::error::{MessagingError, Result, TransportError};
use crate::metrics::{HandlerMetrics, HandlerMetricsSnapshot};
use crate::pool::MessageBufferPool;
use crate::transports::{
    CancelOutcome, Transport, TransportCompletion, TransportOutcome, TransportToken,
};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use ptp_codec::{HeaderError, MessageHeader, MessageKind, Rank, Tag};
use ptp_config::MessagingConfig;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Handle for a posted send or receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Non-terminal state of a tracked operation.
///
/// Terminal states (completed, failed, cancelled) are reported through the
/// completion stream; once reported the operation is no longer tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Staged locally, waiting for the transport to accept it
    Posted,
    /// Submitted to the transport
    InFlight,
}

/// Outcome of one operation, with all pooled resources already returned
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Sent {
        op: OperationId,
        header: MessageHeader,
    },
    Received {
        op: OperationId,
        header: MessageHeader,
        payload: Bytes,
    },
    Failed {
        op: OperationId,
        error: MessagingError,
    },
    Cancelled {
        op: OperationId,
    },
    /// A frame arrived but its header could not be trusted; it was dropped
    Malformed {
        op: OperationId,
        error: HeaderError,
    },
}

impl Completion {
    pub fn op(&self) -> OperationId {
        match self {
            Completion::Sent { op, .. }
            | Completion::Received { op, .. }
            | Completion::Failed { op, .. }
            | Completion::Cancelled { op }
            | Completion::Malformed { op, .. } => *op,
        }
    }
}

/// Capabilities shared by the base and point-to-point handlers
pub trait Handler: Send + Sync {
    type Completion;
    type Completions<'a>: Iterator<Item = Self::Completion>
    where
        Self: 'a;

    fn post_send(&self, payload: &[u8], destination: Rank, tag: Tag) -> Result<OperationId>;

    /// Post a receive that accepts the next arrival
    fn post_receive(&self) -> Result<OperationId>;

    fn poll_completions(&self) -> Self::Completions<'_>;

    fn cancel(&self, op: OperationId) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum OpKind {
    /// Header template: kind, tag and destination; sequence stamped on submit
    Send { header: MessageHeader },
    Receive,
}

struct InFlight {
    token: Option<TransportToken>,
    buffer: MessageBuffer,
    kind: OpKind,
}

#[derive(Default)]
struct SendState {
    /// Sends staged but refused by the transport, oldest first
    pending: VecDeque<OperationId>,
    /// Next sequence number per (destination, tag)
    sequences: HashMap<(Rank, Tag), u32>,
}

/// Completion whose buffer has not been released yet
pub(crate) enum RawCompletion {
    Sent {
        op: OperationId,
        header: MessageHeader,
        buffer: MessageBuffer,
    },
    Received {
        op: OperationId,
        header: MessageHeader,
        buffer: MessageBuffer,
    },
    /// `lost` is the header of an arrival that could not be delivered, when
    /// its leading bytes still decode
    Failed {
        op: OperationId,
        error: MessagingError,
        lost: Option<MessageHeader>,
        buffer: MessageBuffer,
    },
    Cancelled {
        op: OperationId,
        buffer: MessageBuffer,
    },
    Malformed {
        op: OperationId,
        error: HeaderError,
        lost: Option<MessageHeader>,
        buffer: MessageBuffer,
    },
}

enum Pending {
    Ready(RawCompletion),
    Transport {
        completion: TransportCompletion,
        /// First poll that found the token unregistered
        deferred_since: Option<Instant>,
    },
}

enum Resolution {
    Ready(RawCompletion),
    /// Token not registered yet; the submitting thread is still recording it
    Deferred(TransportCompletion),
    Dropped,
}

/// Base message handler for one rank
pub struct MessageHandler {
    rank: Rank,
    pool: MessageBufferPool,
    transport: Arc<dyn Transport>,
    max_payload_size: u32,
    max_completions_per_poll: usize,
    stray_completion_timeout: Duration,
    next_op: AtomicU64,
    in_flight: DashMap<OperationId, InFlight>,
    tokens: DashMap<TransportToken, OperationId>,
    sends: Mutex<SendState>,
    backlog: Mutex<VecDeque<Pending>>,
    metrics: HandlerMetrics,
}

impl MessageHandler {
    /// Create a handler over `transport`, drawing buffers from `pool`
    pub fn new(
        transport: Arc<dyn Transport>,
        pool: MessageBufferPool,
        config: &MessagingConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| MessagingError::configuration(e.to_string()))?;

        let rank = transport.local_rank();
        info!(
            rank,
            transport = transport.name(),
            pool = pool.id(),
            max_payload = config.max_payload_size(),
            "Created message handler"
        );

        Ok(Self {
            rank,
            pool,
            transport,
            max_payload_size: config.max_payload_size(),
            max_completions_per_poll: config.handler.max_completions_per_poll,
            stray_completion_timeout: config.stray_completion_timeout(),
            next_op: AtomicU64::new(1),
            in_flight: DashMap::new(),
            tokens: DashMap::new(),
            sends: Mutex::new(SendState::default()),
            backlog: Mutex::new(VecDeque::new()),
            metrics: HandlerMetrics::new(),
        })
    }

    /// Create a handler with its own pool built from `config.pool`
    pub fn with_config(transport: impl Transport + 'static, config: &MessagingConfig) -> Result<Self> {
        let pool = MessageBufferPool::new(config.pool.clone())?;
        Self::new(Arc::new(transport), pool, config)
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn pool(&self) -> &MessageBufferPool {
        &self.pool
    }

    pub fn max_payload_size(&self) -> u32 {
        self.max_payload_size
    }

    /// Operations posted and not yet reported by a poll
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Sends waiting for the transport to accept them
    pub fn pending_send_count(&self) -> usize {
        self.sends.lock().pending.len()
    }

    pub fn operation_state(&self, op: OperationId) -> Option<OperationState> {
        self.in_flight.get(&op).map(|entry| match entry.token {
            Some(_) => OperationState::InFlight,
            None => OperationState::Posted,
        })
    }

    pub fn metrics(&self) -> HandlerMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn allocate_operation_id(&self) -> OperationId {
        OperationId(self.next_op.fetch_add(1, Ordering::Relaxed))
    }

    /// Send `payload` as a DATA message
    pub fn post_send(&self, payload: &[u8], destination: Rank, tag: Tag) -> Result<OperationId> {
        self.post_message(payload, destination, tag, MessageKind::Data)
    }

    /// Send `payload` with an explicit message kind
    pub fn post_message(
        &self,
        payload: &[u8],
        destination: Rank,
        tag: Tag,
        kind: MessageKind,
    ) -> Result<OperationId> {
        let buffer = self.pool.acquire_for(payload.len())?;
        self.post_staged(buffer, payload, destination, tag, kind)
    }

    /// Like [`post_send`](Self::post_send) but never waits for a buffer
    pub fn try_post_send(&self, payload: &[u8], destination: Rank, tag: Tag) -> Result<OperationId> {
        if payload.len() > self.pool.buffer_capacity() {
            return Err(MessagingError::overflow(
                payload.len(),
                0,
                self.pool.buffer_capacity(),
            ));
        }
        let buffer = self.try_acquire("try_post_send")?;
        self.post_staged(buffer, payload, destination, tag, MessageKind::Data)
    }

    /// Post a receive for the next frame that arrives at this rank
    pub fn post_receive(&self) -> Result<OperationId> {
        let buffer = self.pool.acquire()?;
        self.post_armed(buffer)
    }

    /// Like [`post_receive`](Self::post_receive) but never waits for a buffer
    pub fn try_post_receive(&self) -> Result<OperationId> {
        let buffer = self.try_acquire("try_post_receive")?;
        self.post_armed(buffer)
    }

    fn try_acquire(&self, context: &str) -> Result<MessageBuffer> {
        self.pool.try_acquire().ok_or_else(|| {
            MessagingError::pool_exhausted(
                self.pool.in_use_count(),
                self.pool.max_buffers(),
                context,
            )
        })
    }

    fn post_staged(
        &self,
        mut buffer: MessageBuffer,
        payload: &[u8],
        destination: Rank,
        tag: Tag,
        kind: MessageKind,
    ) -> Result<OperationId> {
        let header = MessageHeader::new(self.rank, destination, tag).with_kind(kind);
        buffer.stage(payload, header)?;
        let op = self.allocate_operation_id();
        self.metrics.record_send_posted();

        let mut sends = self.sends.lock();
        if sends.pending.is_empty() {
            match self.transmit(&mut sends, &mut buffer, header) {
                Ok(token) => {
                    drop(sends);
                    self.track(op, token, buffer, OpKind::Send { header });
                    trace!(%op, destination, tag, bytes = payload.len(), "Send posted");
                    return Ok(op);
                }
                Err(MessagingError::Transport(TransportError::WouldBlock)) => {}
                Err(error) => {
                    drop(sends);
                    self.metrics.record_error(error.category());
                    self.recycle(buffer);
                    return Err(error);
                }
            }
        }

        sends.pending.push_back(op);
        self.in_flight.insert(
            op,
            InFlight {
                token: None,
                buffer,
                kind: OpKind::Send { header },
            },
        );
        self.metrics.record_back_pressure();
        debug!(%op, destination, tag, queued = sends.pending.len(), "Send queued behind back-pressure");
        Ok(op)
    }

    fn post_armed(&self, mut buffer: MessageBuffer) -> Result<OperationId> {
        buffer.arm_receive()?;
        buffer.mark_in_flight()?;
        let token = match self.transport.submit_receive(buffer.frame_capacity()) {
            Ok(token) => token,
            Err(error) => {
                let error = MessagingError::from(error);
                self.metrics.record_error(error.category());
                self.recycle(buffer);
                return Err(error);
            }
        };

        let op = self.allocate_operation_id();
        self.track(op, token, buffer, OpKind::Receive);
        self.metrics.record_receive_posted();
        trace!(%op, %token, "Receive posted");
        Ok(op)
    }

    /// Stamp the channel's next sequence number and submit. Caller holds the
    /// send lock; the sequence only advances when the transport accepts.
    fn transmit(
        &self,
        sends: &mut SendState,
        buffer: &mut MessageBuffer,
        header: MessageHeader,
    ) -> Result<TransportToken> {
        let channel = (header.destination, header.tag);
        if buffer.state() == BufferState::Filling {
            let sequence = sends.sequences.get(&channel).copied().unwrap_or(0);
            buffer.stage(&[], header.with_sequence(sequence))?;
            buffer.mark_in_flight()?;
        }

        let token = self
            .transport
            .submit_send(buffer.wire_bytes(), header.destination)?;
        let next = buffer
            .header()
            .map_or(0, |stamped| stamped.sequence.wrapping_add(1));
        sends.sequences.insert(channel, next);
        Ok(token)
    }

    /// Record an operation, entry first so a completion never finds a token
    /// whose entry is missing
    fn track(&self, op: OperationId, token: TransportToken, buffer: MessageBuffer, kind: OpKind) {
        self.in_flight.insert(
            op,
            InFlight {
                token: Some(token),
                buffer,
                kind,
            },
        );
        self.tokens.insert(token, op);
    }

    /// Resubmit queued sends in order until the transport pushes back again
    fn flush_pending(&self) {
        let mut sends = self.sends.lock();
        while let Some(&op) = sends.pending.front() {
            let Some(mut entry) = self.in_flight.get_mut(&op) else {
                sends.pending.pop_front();
                continue;
            };
            let OpKind::Send { header } = entry.kind else {
                sends.pending.pop_front();
                continue;
            };

            match self.transmit(&mut sends, &mut entry.buffer, header) {
                Ok(token) => {
                    entry.token = Some(token);
                    drop(entry);
                    self.tokens.insert(token, op);
                    sends.pending.pop_front();
                    trace!(%op, %token, "Queued send submitted");
                }
                Err(MessagingError::Transport(TransportError::WouldBlock)) => break,
                Err(error) => {
                    drop(entry);
                    sends.pending.pop_front();
                    warn!(%op, %error, "Queued send failed on submission");
                    self.metrics.record_error(error.category());
                    if let Some((_, entry)) = self.in_flight.remove(&op) {
                        self.backlog.lock().push_back(Pending::Ready(RawCompletion::Failed {
                            op,
                            error,
                            lost: None,
                            buffer: entry.buffer,
                        }));
                    }
                }
            }
        }
    }

    /// Cancel a posted operation.
    ///
    /// Queued sends are withdrawn locally. Submitted operations are withdrawn
    /// only if the transport agrees; otherwise `CancelNotSupported` is
    /// returned and the operation completes normally.
    pub fn cancel(&self, op: OperationId) -> Result<()> {
        {
            let mut sends = self.sends.lock();
            if let Some(position) = sends.pending.iter().position(|queued| *queued == op) {
                sends.pending.remove(position);
                drop(sends);
                self.finish_cancel(op);
                return Ok(());
            }
        }

        let token = match self.in_flight.get(&op) {
            Some(entry) => entry.token,
            None => return Err(MessagingError::UnknownOperation { op }),
        };
        let Some(token) = token else {
            return Err(MessagingError::cancel_not_supported(
                op,
                "operation is being submitted",
            ));
        };

        match self.transport.cancel(token) {
            CancelOutcome::Cancelled => {
                self.tokens.remove(&token);
                self.finish_cancel(op);
                Ok(())
            }
            CancelOutcome::NotSupported => Err(MessagingError::cancel_not_supported(
                op,
                "transport already committed the operation",
            )),
            CancelOutcome::Unknown => Err(MessagingError::cancel_not_supported(
                op,
                "transport already finished the operation",
            )),
        }
    }

    fn finish_cancel(&self, op: OperationId) {
        if let Some((_, entry)) = self.in_flight.remove(&op) {
            self.metrics.record_cancelled();
            debug!(%op, "Operation cancelled");
            self.backlog
                .lock()
                .push_back(Pending::Ready(RawCompletion::Cancelled {
                    op,
                    buffer: entry.buffer,
                }));
        }
    }

    /// Completions observed since the last poll, resolved lazily.
    ///
    /// Items not consumed before the iterator is dropped are kept and
    /// yielded first by the next poll.
    pub fn poll_completions(&self) -> Completions<'_> {
        Completions {
            raw: self.poll_raw(),
        }
    }

    pub(crate) fn poll_raw(&self) -> RawCompletions<'_> {
        self.flush_pending();
        let mut queue = std::mem::take(&mut *self.backlog.lock());
        queue.extend(
            self.transport
                .poll(self.max_completions_per_poll)
                .into_iter()
                .map(|completion| Pending::Transport {
                    completion,
                    deferred_since: None,
                }),
        );
        RawCompletions {
            handler: self,
            queue,
            deferred: Vec::new(),
        }
    }

    fn resolve(&self, completion: TransportCompletion) -> Resolution {
        let Some((_, op)) = self.tokens.remove(&completion.token) else {
            trace!(token = %completion.token, "Completion for unregistered token, deferring");
            return Resolution::Deferred(completion);
        };
        let Some((_, entry)) = self.in_flight.remove(&op) else {
            warn!(%op, token = %completion.token, "Completion for untracked operation dropped");
            return Resolution::Dropped;
        };
        let InFlight {
            mut buffer, kind, ..
        } = entry;
        let capacity = buffer.capacity();

        let raw = match (kind, completion.outcome) {
            (OpKind::Send { header }, TransportOutcome::Sent) => {
                complete(&mut buffer);
                self.metrics.record_sent(buffer.len());
                let header = buffer.header().copied().unwrap_or(header);
                RawCompletion::Sent { op, header, buffer }
            }
            (OpKind::Receive, TransportOutcome::Received(frame)) => {
                match buffer.fill_from_wire(&frame, self.max_payload_size) {
                    Ok(header) => {
                        self.metrics.record_received(buffer.len());
                        trace!(%op, source = header.source, tag = header.tag, sequence = header.sequence, "Message received");
                        RawCompletion::Received { op, header, buffer }
                    }
                    Err(MessagingError::MalformedHeader(error)) => {
                        complete(&mut buffer);
                        warn!(%op, bytes = frame.len(), capacity, %error, "Dropping malformed frame");
                        self.metrics.record_error("malformed_header");
                        RawCompletion::Malformed {
                            op,
                            error,
                            lost: leading_header(&frame),
                            buffer,
                        }
                    }
                    Err(error) => {
                        complete(&mut buffer);
                        warn!(%op, %error, "Receive failed");
                        self.metrics.record_error(error.category());
                        RawCompletion::Failed {
                            op,
                            error,
                            lost: leading_header(&frame),
                            buffer,
                        }
                    }
                }
            }
            (OpKind::Receive, TransportOutcome::Oversized { len, leading }) => {
                complete(&mut buffer);
                let error = MessagingError::from(TransportError::failed(format!(
                    "frame of {} bytes exceeds receive capacity {}",
                    len,
                    leading.len()
                )));
                warn!(%op, bytes = len, capacity, "Dropping oversized frame");
                self.metrics.record_error(error.category());
                RawCompletion::Failed {
                    op,
                    error,
                    lost: leading_header(&leading),
                    buffer,
                }
            }
            (_, TransportOutcome::Failed(message)) => {
                complete(&mut buffer);
                warn!(%op, %message, "Transport reported failure");
                let error = MessagingError::from(TransportError::failed(message));
                self.metrics.record_error(error.category());
                RawCompletion::Failed {
                    op,
                    error,
                    lost: None,
                    buffer,
                }
            }
            (kind, outcome) => {
                complete(&mut buffer);
                let error = MessagingError::from(TransportError::failed(format!(
                    "outcome {:?} does not fit a {:?} operation",
                    outcome, kind
                )));
                warn!(%op, %error, "Mismatched transport completion");
                self.metrics.record_error(error.category());
                RawCompletion::Failed {
                    op,
                    error,
                    lost: None,
                    buffer,
                }
            }
        };
        Resolution::Ready(raw)
    }

    /// Release the buffer and produce the caller-facing completion
    fn finish(&self, raw: RawCompletion) -> Completion {
        match raw {
            RawCompletion::Sent { op, header, buffer } => {
                self.recycle(buffer);
                Completion::Sent { op, header }
            }
            RawCompletion::Received { op, header, buffer } => {
                let payload = Bytes::copy_from_slice(buffer.payload());
                self.recycle(buffer);
                Completion::Received {
                    op,
                    header,
                    payload,
                }
            }
            RawCompletion::Failed {
                op, error, buffer, ..
            } => {
                self.recycle(buffer);
                Completion::Failed { op, error }
            }
            RawCompletion::Cancelled { op, buffer } => {
                self.recycle(buffer);
                Completion::Cancelled { op }
            }
            RawCompletion::Malformed {
                op, error, buffer, ..
            } => {
                self.recycle(buffer);
                Completion::Malformed { op, error }
            }
        }
    }

    /// Return a buffer the transport no longer references to the pool
    pub(crate) fn recycle(&self, mut buffer: MessageBuffer) {
        complete(&mut buffer);
        if let Err(error) = self.pool.release(buffer) {
            warn!(%error, "Failed to release buffer");
            self.metrics.record_error(error.category());
        }
    }
}

/// Header at the front of an undeliverable frame, ignoring the payload limit
/// and the frame length
fn leading_header(frame: &[u8]) -> Option<MessageHeader> {
    MessageHeader::decode(frame, u32::MAX).ok()
}

/// Move an in-flight buffer to COMPLETE; other states are left alone
fn complete(buffer: &mut MessageBuffer) {
    if buffer.state() == BufferState::InFlight {
        if let Err(error) = buffer.mark_complete() {
            debug!(%error, "Could not complete buffer");
        }
    }
}

impl Drop for MessageHandler {
    fn drop(&mut self) {
        let outstanding = self.in_flight.len();
        if outstanding > 0 {
            debug!(rank = self.rank, outstanding, "Handler dropped with operations outstanding");
        }
    }
}

impl Handler for MessageHandler {
    type Completion = Completion;
    type Completions<'a> = Completions<'a>;

    fn post_send(&self, payload: &[u8], destination: Rank, tag: Tag) -> Result<OperationId> {
        MessageHandler::post_send(self, payload, destination, tag)
    }

    fn post_receive(&self) -> Result<OperationId> {
        MessageHandler::post_receive(self)
    }

    fn poll_completions(&self) -> Completions<'_> {
        MessageHandler::poll_completions(self)
    }

    fn cancel(&self, op: OperationId) -> Result<()> {
        MessageHandler::cancel(self, op)
    }
}

/// Lazy batch of raw completions; unconsumed items return to the backlog
pub(crate) struct RawCompletions<'a> {
    handler: &'a MessageHandler,
    queue: VecDeque<Pending>,
    deferred: Vec<(TransportCompletion, Instant)>,
}

impl Iterator for RawCompletions<'_> {
    type Item = RawCompletion;

    fn next(&mut self) -> Option<RawCompletion> {
        while let Some(pending) = self.queue.pop_front() {
            match pending {
                Pending::Ready(raw) => return Some(raw),
                Pending::Transport {
                    completion,
                    deferred_since,
                } => match self.handler.resolve(completion) {
                    Resolution::Ready(raw) => return Some(raw),
                    Resolution::Deferred(completion) => match deferred_since {
                        Some(since) if since.elapsed() >= self.handler.stray_completion_timeout => {
                            warn!(
                                token = %completion.token,
                                waited_ms = since.elapsed().as_millis() as u64,
                                "Dropping completion for a token that was never registered"
                            );
                            self.handler.metrics.record_error("stray_completion");
                        }
                        Some(since) => self.deferred.push((completion, since)),
                        None => self.deferred.push((completion, Instant::now())),
                    },
                    Resolution::Dropped => {}
                },
            }
        }
        None
    }
}

impl Drop for RawCompletions<'_> {
    fn drop(&mut self) {
        if self.queue.is_empty() && self.deferred.is_empty() {
            return;
        }
        let mut leftovers: Vec<Pending> = self.queue.drain(..).collect();
        leftovers.extend(
            self.deferred
                .drain(..)
                .map(|(completion, since)| Pending::Transport {
                    completion,
                    deferred_since: Some(since),
                }),
        );

        // Ahead of anything queued since this batch was taken
        let mut backlog = self.handler.backlog.lock();
        for pending in leftovers.into_iter().rev() {
            backlog.push_front(pending);
        }
    }
}

/// Lazy batch of completions returned by [`MessageHandler::poll_completions`]
pub struct Completions<'a> {
    raw: RawCompletions<'a>,
}

impl Iterator for Completions<'_> {
    type Item = Completion;

    fn next(&mut self) -> Option<Completion> {
        let raw = self.raw.next()?;
        Some(self.raw.handler.finish(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportResult;
    use crate::transports::{LocalNetwork, LocalOptions};
    use ptp_config::PoolConfig;

    fn handler(network: &LocalNetwork, rank: Rank, pool: PoolConfig) -> MessageHandler {
        let config = MessagingConfig::default().with_pool(pool);
        MessageHandler::with_config(network.endpoint(rank).unwrap(), &config).unwrap()
    }

    fn drain(handler: &MessageHandler) -> Vec<Completion> {
        handler.poll_completions().collect()
    }

    #[test]
    fn test_send_and_receive_hello() {
        let network = LocalNetwork::new(3);
        let sender = handler(&network, 0, PoolConfig::fixed(4, 64));
        let receiver = handler(&network, 2, PoolConfig::fixed(4, 64));

        let send = sender.post_send(b"hello", 2, 1).unwrap();
        assert_eq!(sender.operation_state(send), Some(OperationState::InFlight));
        let recv = receiver.post_receive().unwrap();

        let sent = drain(&sender);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Completion::Sent { op, .. } if op == send));

        let received = drain(&receiver);
        assert_eq!(received.len(), 1);
        match &received[0] {
            Completion::Received {
                op,
                header,
                payload,
            } => {
                assert_eq!(*op, recv);
                assert_eq!(header.kind, MessageKind::Data);
                assert_eq!(header.source, 0);
                assert_eq!(header.destination, 2);
                assert_eq!(header.tag, 1);
                assert_eq!(header.payload_size, 5);
                assert_eq!(header.sequence, 0);
                assert_eq!(payload.as_ref(), b"hello");
            }
            other => panic!("Expected Received, got {:?}", other),
        }

        assert_eq!(sender.pool().in_use_count(), 0);
        assert_eq!(receiver.pool().in_use_count(), 0);
        assert_eq!(sender.operation_state(send), None);
        assert_eq!(sender.in_flight_count(), 0);
    }

    #[test]
    fn test_pool_exhaustion_then_recovery() {
        let network = LocalNetwork::new(2);
        let sender = handler(&network, 0, PoolConfig::fixed(1, 64));

        sender.post_send(b"one", 1, 0).unwrap();
        let err = sender.post_send(b"two", 1, 0).unwrap_err();
        assert!(matches!(err, MessagingError::PoolExhausted { .. }));
        assert!(err.is_retryable());

        assert_eq!(drain(&sender).len(), 1);
        assert!(sender.post_send(b"two", 1, 0).is_ok());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let network = LocalNetwork::new(2);
        let sender = handler(&network, 0, PoolConfig::fixed(2, 8));
        let err = sender.post_send(&[0u8; 9], 1, 0).unwrap_err();
        assert!(matches!(err, MessagingError::BufferOverflow { .. }));
        assert_eq!(sender.pool().in_use_count(), 0);
    }

    #[test]
    fn test_unknown_destination_releases_buffer() {
        let network = LocalNetwork::new(2);
        let sender = handler(&network, 0, PoolConfig::fixed(2, 64));
        let err = sender.post_send(b"lost", 7, 0).unwrap_err();
        assert_eq!(
            err,
            MessagingError::Transport(TransportError::UnknownRank { rank: 7 })
        );
        assert_eq!(sender.pool().in_use_count(), 0);
        assert_eq!(sender.in_flight_count(), 0);
    }

    #[test]
    fn test_back_pressure_queues_sends_in_order() {
        let network = LocalNetwork::with_options(
            2,
            LocalOptions {
                send_window: Some(1),
                ..LocalOptions::default()
            },
        );
        let sender = handler(&network, 0, PoolConfig::fixed(4, 64));
        let receiver = handler(&network, 1, PoolConfig::fixed(4, 64));

        let ops: Vec<_> = (0..3u8)
            .map(|i| sender.post_send(&[i], 1, 5).unwrap())
            .collect();
        assert_eq!(sender.pending_send_count(), 2);
        assert_eq!(sender.operation_state(ops[1]), Some(OperationState::Posted));

        let mut sent = Vec::new();
        for _ in 0..10 {
            sent.extend(drain(&sender).into_iter().map(|c| c.op()));
            if sent.len() == 3 {
                break;
            }
        }
        assert_eq!(sent, ops);
        assert_eq!(sender.metrics().back_pressure, 2);

        for _ in 0..3 {
            receiver.post_receive().unwrap();
        }
        let received: Vec<_> = drain(&receiver)
            .into_iter()
            .map(|c| match c {
                Completion::Received {
                    header, payload, ..
                } => (header.sequence, payload[0]),
                other => panic!("Expected Received, got {:?}", other),
            })
            .collect();
        assert_eq!(received, vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn test_cancel_queued_send_leaves_no_sequence_gap() {
        let network = LocalNetwork::with_options(
            2,
            LocalOptions {
                send_window: Some(1),
                ..LocalOptions::default()
            },
        );
        let sender = handler(&network, 0, PoolConfig::fixed(4, 64));
        let receiver = handler(&network, 1, PoolConfig::fixed(4, 64));

        let first = sender.post_send(b"a", 1, 0).unwrap();
        let queued = sender.post_send(b"b", 1, 0).unwrap();
        sender.cancel(queued).unwrap();
        assert_eq!(sender.pending_send_count(), 0);

        let completions = drain(&sender);
        assert_eq!(
            completions.iter().map(Completion::op).collect::<Vec<_>>(),
            vec![queued, first]
        );
        assert!(matches!(completions[0], Completion::Cancelled { .. }));

        sender.post_send(b"c", 1, 0).unwrap();
        drain(&sender);

        receiver.post_receive().unwrap();
        receiver.post_receive().unwrap();
        let sequences: Vec<_> = drain(&receiver)
            .into_iter()
            .filter_map(|c| match c {
                Completion::Received { header, .. } => Some(header.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![0, 1]);
        assert_eq!(sender.pool().in_use_count(), 0);
    }

    #[test]
    fn test_cancel_receive() {
        let network = LocalNetwork::new(1);
        let receiver = handler(&network, 0, PoolConfig::fixed(2, 64));
        let op = receiver.post_receive().unwrap();
        receiver.cancel(op).unwrap();

        assert_eq!(drain(&receiver), vec![Completion::Cancelled { op }]);
        assert_eq!(receiver.pool().in_use_count(), 0);
        assert_eq!(receiver.metrics().cancelled, 1);
    }

    #[test]
    fn test_cancel_submitted_send_not_supported() {
        let network = LocalNetwork::new(2);
        let sender = handler(&network, 0, PoolConfig::fixed(2, 64));
        let op = sender.post_send(b"x", 1, 0).unwrap();

        let err = sender.cancel(op).unwrap_err();
        assert!(matches!(err, MessagingError::CancelNotSupported { .. }));
        assert!(matches!(drain(&sender)[..], [Completion::Sent { .. }]));
    }

    #[test]
    fn test_cancel_unknown_operation() {
        let network = LocalNetwork::new(1);
        let handler = handler(&network, 0, PoolConfig::fixed(1, 64));
        let op = OperationId::from_raw(999);
        assert_eq!(
            handler.cancel(op),
            Err(MessagingError::UnknownOperation { op })
        );
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let network = LocalNetwork::new(2);
        let receiver = handler(&network, 1, PoolConfig::fixed(2, 64));
        receiver.post_receive().unwrap();
        network.inject(1, vec![0xFFu8; 30]).unwrap();

        let completions = drain(&receiver);
        assert!(matches!(
            completions[..],
            [Completion::Malformed {
                error: HeaderError::UnknownKind { kind: 0xFF, .. },
                ..
            }]
        ));
        assert_eq!(receiver.pool().in_use_count(), 0);
        assert_eq!(
            receiver.metrics().error_types.get("malformed_header"),
            Some(&1)
        );
    }

    #[test]
    fn test_truncated_and_oversized_frames() {
        let network = LocalNetwork::new(2);
        let receiver = handler(&network, 1, PoolConfig::fixed(4, 64));

        // Header promising more payload than arrives
        let mut partial = MessageHeader::new(0, 1, 3).with_payload_size(10).encode().to_vec();
        partial.extend_from_slice(b"abc");
        network.inject(1, partial).unwrap();
        // Too short to hold a header at all
        network.inject(1, vec![0u8; 4]).unwrap();

        receiver.post_receive().unwrap();
        receiver.post_receive().unwrap();
        let completions = drain(&receiver);
        assert!(matches!(
            completions[..],
            [
                Completion::Malformed {
                    error: HeaderError::LengthMismatch { .. },
                    ..
                },
                Completion::Malformed {
                    error: HeaderError::Truncated { .. },
                    ..
                }
            ]
        ));
        assert_eq!(receiver.pool().in_use_count(), 0);
    }

    #[test]
    fn test_control_message_kind() {
        let network = LocalNetwork::new(2);
        let sender = handler(&network, 0, PoolConfig::fixed(2, 64));
        let receiver = handler(&network, 1, PoolConfig::fixed(2, 64));

        sender.post_message(b"", 1, 0, MessageKind::Control).unwrap();
        receiver.post_receive().unwrap();
        match &drain(&receiver)[..] {
            [Completion::Received {
                header, payload, ..
            }] => {
                assert_eq!(header.kind, MessageKind::Control);
                assert!(payload.is_empty());
            }
            other => panic!("Expected one Received, got {:?}", other),
        }
    }

    #[test]
    fn test_dropped_iterator_keeps_unconsumed_completions() {
        let network = LocalNetwork::new(2);
        let sender = handler(&network, 0, PoolConfig::fixed(4, 64));
        let ops: Vec<_> = (0..3)
            .map(|_| sender.post_send(b"x", 1, 0).unwrap())
            .collect();

        let first = sender.poll_completions().next().map(|c| c.op());
        assert_eq!(first, Some(ops[0]));
        assert_eq!(sender.pool().in_use_count(), 2);

        let rest: Vec<_> = drain(&sender).iter().map(Completion::op).collect();
        assert_eq!(rest, &ops[1..]);
        assert_eq!(sender.pool().in_use_count(), 0);
    }

    #[test]
    fn test_generic_handler_usage() {
        fn round_trip<H: Handler<Completion = Completion>>(h: &H) -> usize {
            h.post_send(b"ping", 0, 0).unwrap();
            h.post_receive().unwrap();
            h.poll_completions().count()
        }

        let network = LocalNetwork::new(1);
        let handler = handler(&network, 0, PoolConfig::fixed(2, 64));
        assert_eq!(round_trip(&handler), 2);
    }

    #[test]
    fn test_oversized_arrival_fails_receive_and_recycles() {
        let network = LocalNetwork::new(2);
        let sender = handler(&network, 0, PoolConfig::fixed(2, 128));
        let receiver = handler(&network, 1, PoolConfig::fixed(2, 16));

        sender.post_send(&[7u8; 40], 1, 3).unwrap();
        let recv = receiver.post_receive().unwrap();

        let completions = drain(&receiver);
        match &completions[..] {
            [Completion::Failed { op, error }] => {
                assert_eq!(*op, recv);
                assert!(error.to_string().contains("61 bytes"), "{}", error);
            }
            other => panic!("unexpected completions: {:?}", other),
        }
        assert_eq!(receiver.pool().free_count(), 2);
    }

    /// Reports a single completion for a token it never handed out
    struct StrayTransport {
        stray: Mutex<Option<TransportCompletion>>,
    }

    impl Transport for StrayTransport {
        fn local_rank(&self) -> Rank {
            0
        }

        fn submit_send(&self, _frame: &[u8], _destination: Rank) -> TransportResult<TransportToken> {
            Err(TransportError::WouldBlock)
        }

        fn submit_receive(&self, _capacity: usize) -> TransportResult<TransportToken> {
            Err(TransportError::closed("receives not supported"))
        }

        fn poll(&self, _max: usize) -> Vec<TransportCompletion> {
            self.stray.lock().take().into_iter().collect()
        }

        fn cancel(&self, _token: TransportToken) -> CancelOutcome {
            CancelOutcome::Unknown
        }
    }

    #[test]
    fn test_stray_completion_dropped_after_timeout() {
        let mut config = MessagingConfig::default().with_pool(PoolConfig::fixed(1, 16));
        config.handler.stray_completion_timeout_ms = 0;
        let transport = StrayTransport {
            stray: Mutex::new(Some(TransportCompletion {
                token: TransportToken(999),
                outcome: TransportOutcome::Sent,
            })),
        };
        let pool = MessageBufferPool::new(config.pool.clone()).unwrap();
        let handler = MessageHandler::new(Arc::new(transport), pool, &config).unwrap();
        let strays = |h: &MessageHandler| h.metrics().error_types.get("stray_completion").copied();

        // First sighting is kept for a registration still in progress
        assert_eq!(drain(&handler).len(), 0);
        assert_eq!(strays(&handler), None);
        assert_eq!(handler.backlog.lock().len(), 1);

        assert_eq!(drain(&handler).len(), 0);
        assert_eq!(strays(&handler), Some(1));
        assert!(handler.backlog.lock().is_empty());

        assert_eq!(drain(&handler).len(), 0);
        assert_eq!(strays(&handler), Some(1));
    }
}
