//! In-Process Transport
//!
//! A fully connected fabric of ranks inside one process. Each rank owns a
//! crossbeam mailbox; sends copy the frame into the destination's mailbox and
//! receives are matched against arrivals in FIFO order when the endpoint is
//! polled.
//!
//! Two knobs make it useful for exercising the handlers' edge cases:
//! - `reorder_seed`: shuffle each batch of arrivals with a seeded RNG, so
//!   frames on the same channel can overtake each other
//! - `send_window`: cap on sends awaiting completion, beyond which
//!   submissions fail with `WouldBlock`

use super::{CancelOutcome, Transport, TransportCompletion, TransportOutcome, TransportToken};
use crate::error::{TransportError, TransportResult};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use ptp_codec::Rank;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Behaviour switches for a [`LocalNetwork`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalOptions {
    /// Shuffle arrivals with an RNG seeded from this value
    pub reorder_seed: Option<u64>,
    /// Sends allowed to await completion before `WouldBlock`
    pub send_window: Option<usize>,
}

/// Shared fabric connecting every rank
#[derive(Clone)]
pub struct LocalNetwork {
    fabric: Arc<Fabric>,
}

struct Fabric {
    mailboxes: Vec<(Sender<Bytes>, Receiver<Bytes>)>,
    reorder: Option<Mutex<StdRng>>,
    send_window: Option<usize>,
    /// Set while a rank has a live endpoint
    claimed: Vec<AtomicBool>,
}

/// One rank's endpoint on a [`LocalNetwork`]
pub struct LocalTransport {
    rank: Rank,
    fabric: Arc<Fabric>,
    next_token: AtomicU64,
    state: Mutex<EndpointState>,
}

#[derive(Default)]
struct EndpointState {
    /// Sends already copied out but not yet reported by `poll`
    unreported_sends: VecDeque<TransportToken>,
    /// Posted receives, matched in posting order
    receives: VecDeque<(TransportToken, usize)>,
    /// Frames pulled from the mailbox that no receive has taken yet
    inbox: VecDeque<Bytes>,
}

impl LocalNetwork {
    pub fn new(ranks: usize) -> Self {
        Self::with_options(ranks, LocalOptions::default())
    }

    pub fn with_options(ranks: usize, options: LocalOptions) -> Self {
        let mailboxes = (0..ranks).map(|_| crossbeam_channel::unbounded()).collect();
        debug!(ranks, ?options, "Created local network");
        Self {
            fabric: Arc::new(Fabric {
                mailboxes,
                reorder: options
                    .reorder_seed
                    .map(|seed| Mutex::new(StdRng::seed_from_u64(seed))),
                send_window: options.send_window,
                claimed: (0..ranks).map(|_| AtomicBool::new(false)).collect(),
            }),
        }
    }

    pub fn ranks(&self) -> usize {
        self.fabric.mailboxes.len()
    }

    /// Endpoint for `rank`.
    ///
    /// A rank has at most one live endpoint; asking again before the first is
    /// dropped fails with `RankInUse`.
    pub fn endpoint(&self, rank: Rank) -> TransportResult<LocalTransport> {
        self.fabric.mailbox(rank)?;
        let claimed = &self.fabric.claimed[rank as usize];
        if claimed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::RankInUse { rank });
        }
        Ok(LocalTransport {
            rank,
            fabric: Arc::clone(&self.fabric),
            next_token: AtomicU64::new(1),
            state: Mutex::new(EndpointState::default()),
        })
    }

    /// Deliver raw bytes to `rank` as if a peer had sent them.
    ///
    /// Nothing is validated, which is the point: tests use this to feed
    /// corrupt frames to a handler.
    pub fn inject(&self, rank: Rank, frame: impl Into<Bytes>) -> TransportResult<()> {
        self.fabric.deliver(rank, frame.into())
    }
}

impl Fabric {
    fn mailbox(&self, rank: Rank) -> TransportResult<&(Sender<Bytes>, Receiver<Bytes>)> {
        self.mailboxes
            .get(rank as usize)
            .ok_or(TransportError::UnknownRank { rank })
    }

    fn deliver(&self, rank: Rank, frame: Bytes) -> TransportResult<()> {
        let (sender, _) = self.mailbox(rank)?;
        sender
            .send(frame)
            .map_err(|_| TransportError::closed(format!("mailbox of rank {} disconnected", rank)))
    }
}

impl LocalTransport {
    fn token(&self) -> TransportToken {
        TransportToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Posted receives not yet matched
    pub fn pending_receives(&self) -> usize {
        self.state.lock().receives.len()
    }

    /// Frames waiting for a receive to be posted
    pub fn queued_frames(&self) -> usize {
        let mut state = self.state.lock();
        self.pull_arrivals(&mut state);
        state.inbox.len()
    }

    fn pull_arrivals(&self, state: &mut EndpointState) {
        let Ok((_, receiver)) = self.fabric.mailbox(self.rank) else {
            return;
        };
        let mut arrived: Vec<Bytes> = receiver.try_iter().collect();
        if arrived.is_empty() {
            return;
        }
        if let Some(rng) = &self.fabric.reorder {
            arrived.shuffle(&mut *rng.lock());
        }
        trace!(rank = self.rank, count = arrived.len(), "Pulled arrivals");
        state.inbox.extend(arrived);
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        if let Some(claimed) = self.fabric.claimed.get(self.rank as usize) {
            claimed.store(false, Ordering::Release);
        }
    }
}

impl Transport for LocalTransport {
    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn submit_send(&self, frame: &[u8], destination: Rank) -> TransportResult<TransportToken> {
        let mut state = self.state.lock();
        if let Some(window) = self.fabric.send_window {
            if state.unreported_sends.len() >= window {
                return Err(TransportError::WouldBlock);
            }
        }
        self.fabric
            .deliver(destination, Bytes::copy_from_slice(frame))?;

        let token = self.token();
        state.unreported_sends.push_back(token);
        trace!(rank = self.rank, destination, %token, bytes = frame.len(), "Send submitted");
        Ok(token)
    }

    fn submit_receive(&self, capacity: usize) -> TransportResult<TransportToken> {
        let token = self.token();
        self.state.lock().receives.push_back((token, capacity));
        trace!(rank = self.rank, %token, capacity, "Receive submitted");
        Ok(token)
    }

    fn poll(&self, max: usize) -> Vec<TransportCompletion> {
        let mut state = self.state.lock();
        let mut completions = Vec::new();

        while completions.len() < max {
            let Some(token) = state.unreported_sends.pop_front() else {
                break;
            };
            completions.push(TransportCompletion {
                token,
                outcome: TransportOutcome::Sent,
            });
        }

        self.pull_arrivals(&mut state);
        while completions.len() < max && !state.receives.is_empty() && !state.inbox.is_empty() {
            let (Some((token, capacity)), Some(frame)) =
                (state.receives.pop_front(), state.inbox.pop_front())
            else {
                break;
            };
            let outcome = if frame.len() > capacity {
                TransportOutcome::Oversized {
                    len: frame.len(),
                    leading: frame.slice(..capacity),
                }
            } else {
                TransportOutcome::Received(frame)
            };
            completions.push(TransportCompletion { token, outcome });
        }

        completions
    }

    fn cancel(&self, token: TransportToken) -> CancelOutcome {
        let mut state = self.state.lock();
        if let Some(position) = state.receives.iter().position(|(t, _)| *t == token) {
            state.receives.remove(position);
            return CancelOutcome::Cancelled;
        }
        if state.unreported_sends.contains(&token) {
            // Frame already sits in the peer's mailbox
            return CancelOutcome::NotSupported;
        }
        CancelOutcome::Unknown
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
