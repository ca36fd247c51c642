//! Message Buffer Pool
//!
//! Bounded, thread-safe pool of [`MessageBuffer`]s. Acquisition hands out
//! exclusive ownership; release takes it back and resets the buffer. The pool
//! tracks which slots are out so double and foreign releases are detected
//! rather than silently corrupting the free list.
//!
//! ## Accounting
//!
//! ```text
//! free + in_use == total <= effective_max
//! quarantined ⊆ in_use
//! ```
//!
//! Buffers released while still in flight are quarantined: they stay counted
//! as in use until [`MessageBufferPool::reclaim_quarantined`] is called after
//! the transport has been drained.

use crate::buffer::{BufferId, BufferState, MessageBuffer};
use crate::error::{MessagingError, Result};
use parking_lot::{Condvar, Mutex};
use ptp_config::{AcquirePolicy, PoolConfig};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to a buffer pool. Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct MessageBufferPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    id: u64,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    counters: PoolCounters,
}

struct PoolState {
    /// LIFO so recently used (cache-warm) buffers are handed out first
    free: Vec<MessageBuffer>,
    in_use: HashSet<usize>,
    quarantined: Vec<MessageBuffer>,
    total: usize,
    next_index: usize,
}

#[derive(Default)]
struct PoolCounters {
    acquisitions: AtomicU64,
    releases: AtomicU64,
    growths: AtomicU64,
    exhaustions: AtomicU64,
    waits: AtomicU64,
}

/// Point-in-time view of pool occupancy and activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_id: u64,
    pub total: usize,
    pub free: usize,
    pub in_use: usize,
    pub quarantined: usize,
    pub max_buffers: usize,
    pub buffer_capacity: usize,
    pub acquisitions: u64,
    pub releases: u64,
    pub growths: u64,
    pub exhaustions: u64,
    pub waits: u64,
}

impl MessageBufferPool {
    /// Create a pool and preallocate `initial_buffers`
    pub fn new(config: PoolConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| MessagingError::configuration(e.to_string()))?;

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let initial = config.initial_buffers;
        let capacity = config.buffer_capacity;

        let inner = Arc::new_cyclic(|home: &Weak<PoolInner>| {
            let free = (0..initial)
                .map(|index| MessageBuffer::new(BufferId { pool: id, index }, capacity, home.clone()))
                .collect();
            PoolInner {
                id,
                config,
                state: Mutex::new(PoolState {
                    free,
                    in_use: HashSet::new(),
                    quarantined: Vec::new(),
                    total: initial,
                    next_index: initial,
                }),
                available: Condvar::new(),
                counters: PoolCounters::default(),
            }
        });

        info!(
            pool = id,
            initial,
            max = inner.config.effective_max(),
            capacity,
            "Created message buffer pool"
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Payload capacity of every buffer in this pool
    pub fn buffer_capacity(&self) -> usize {
        self.inner.config.buffer_capacity
    }

    pub fn max_buffers(&self) -> usize {
        self.inner.config.effective_max()
    }

    /// Acquire a FREE buffer following the configured acquire policy.
    ///
    /// Grows the pool when allowed. When nothing is free and the pool is at
    /// its limit, a blocking pool waits for a release (up to its timeout) and
    /// a non-blocking pool fails with `PoolExhausted`.
    pub fn acquire(&self) -> Result<MessageBuffer> {
        match self.inner.config.acquire {
            AcquirePolicy::NonBlocking => {
                let mut state = self.inner.state.lock();
                match self.inner.take(&mut state) {
                    Some(buffer) => Ok(buffer),
                    None => Err(self.inner.exhausted(&state, "acquire")),
                }
            }
            policy @ AcquirePolicy::Blocking { .. } => self.acquire_blocking(policy.timeout()),
        }
    }

    /// Acquire without ever waiting, regardless of policy
    pub fn try_acquire(&self) -> Option<MessageBuffer> {
        let mut state = self.inner.state.lock();
        self.inner.take(&mut state)
    }

    /// Acquire, waiting at most `timeout` for a release
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<MessageBuffer> {
        self.acquire_blocking(Some(timeout))
    }

    /// Acquire a buffer able to stage `payload_len` bytes
    pub fn acquire_for(&self, payload_len: usize) -> Result<MessageBuffer> {
        let capacity = self.buffer_capacity();
        if payload_len > capacity {
            return Err(MessagingError::overflow(payload_len, 0, capacity));
        }
        self.acquire()
    }

    fn acquire_blocking(&self, timeout: Option<Duration>) -> Result<MessageBuffer> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();
        loop {
            if let Some(buffer) = self.inner.take(&mut state) {
                return Ok(buffer);
            }
            self.inner.counters.waits.fetch_add(1, Ordering::Relaxed);
            match deadline {
                None => self.inner.available.wait(&mut state),
                Some(deadline) => {
                    if self
                        .inner
                        .available
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return match self.inner.take(&mut state) {
                            Some(buffer) => Ok(buffer),
                            None => Err(self.inner.exhausted(&state, "acquire timed out")),
                        };
                    }
                }
            }
        }
    }

    /// Return a buffer to the pool.
    ///
    /// The buffer is reset and becomes FREE. Errors:
    /// - `ForeignBuffer`: allocated by another pool (that pool gets it back
    ///   when the rejected buffer is dropped)
    /// - `DoubleRelease`: this pool does not consider the buffer acquired
    /// - `BufferBusy`: still in flight; the buffer is quarantined instead
    pub fn release(&self, mut buffer: MessageBuffer) -> Result<()> {
        let id = buffer.id();
        if id.pool != self.inner.id {
            warn!(buffer = %id, pool = self.inner.id, "Rejected release of foreign buffer");
            return Err(MessagingError::ForeignBuffer {
                buffer: id,
                pool: self.inner.id,
            });
        }

        let outcome = {
            let mut state = self.inner.state.lock();
            if !state.in_use.contains(&id.index) {
                Err(buffer)
            } else if buffer.state() == BufferState::InFlight {
                warn!(buffer = %id, "Released buffer is still in flight, quarantining");
                state.quarantined.push(buffer);
                return Err(MessagingError::BufferBusy { buffer: id });
            } else {
                state.in_use.remove(&id.index);
                buffer.force_free();
                state.free.push(buffer);
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {
                self.inner.counters.releases.fetch_add(1, Ordering::Relaxed);
                self.inner.available.notify_one();
                Ok(())
            }
            Err(mut duplicate) => {
                warn!(buffer = %id, "Double release detected");
                // Dropping must not feed the slot back a second time
                duplicate.detach();
                Err(MessagingError::DoubleRelease { buffer: id })
            }
        }
    }

    /// Move quarantined buffers back to the free list.
    ///
    /// Only call once the transport can no longer touch them (after a drain
    /// or shutdown). Returns the number reclaimed.
    pub fn reclaim_quarantined(&self) -> usize {
        let reclaimed = {
            let mut state = self.inner.state.lock();
            let quarantined = std::mem::take(&mut state.quarantined);
            let count = quarantined.len();
            for mut buffer in quarantined {
                state.in_use.remove(&buffer.id().index);
                buffer.force_free();
                state.free.push(buffer);
            }
            count
        };
        if reclaimed > 0 {
            info!(pool = self.inner.id, reclaimed, "Reclaimed quarantined buffers");
            self.inner.available.notify_all();
        }
        reclaimed
    }

    /// Destroy free buffers until at most `max(target, initial_buffers)`
    /// remain.
    ///
    /// Buffers that are out are never touched, so the pool may stay above the
    /// floor. Returns the number destroyed.
    pub fn shrink(&self, target: usize) -> usize {
        let floor = target.max(self.inner.config.initial_buffers);
        let mut state = self.inner.state.lock();
        let mut destroyed = 0;
        while state.total > floor {
            let Some(mut buffer) = state.free.pop() else {
                break;
            };
            buffer.detach();
            state.total -= 1;
            destroyed += 1;
        }
        if destroyed > 0 {
            debug!(pool = self.inner.id, destroyed, total = state.total, "Shrunk pool");
        }
        destroyed
    }

    pub fn free_count(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.state.lock().in_use.len()
    }

    pub fn total(&self) -> usize {
        self.inner.state.lock().total
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let counters = &self.inner.counters;
        PoolStats {
            pool_id: self.inner.id,
            total: state.total,
            free: state.free.len(),
            in_use: state.in_use.len(),
            quarantined: state.quarantined.len(),
            max_buffers: self.inner.config.effective_max(),
            buffer_capacity: self.inner.config.buffer_capacity,
            acquisitions: counters.acquisitions.load(Ordering::Relaxed),
            releases: counters.releases.load(Ordering::Relaxed),
            growths: counters.growths.load(Ordering::Relaxed),
            exhaustions: counters.exhaustions.load(Ordering::Relaxed),
            waits: counters.waits.load(Ordering::Relaxed),
        }
    }
}

impl PoolInner {
    /// Pop a free buffer or grow by one. Caller holds the state lock.
    fn take(self: &Arc<Self>, state: &mut PoolState) -> Option<MessageBuffer> {
        let buffer = match state.free.pop() {
            Some(buffer) => buffer,
            None if state.total < self.config.effective_max() => {
                let index = state.next_index;
                state.next_index += 1;
                state.total += 1;
                self.counters.growths.fetch_add(1, Ordering::Relaxed);
                debug!(pool = self.id, index, total = state.total, "Grew pool");
                MessageBuffer::new(
                    BufferId {
                        pool: self.id,
                        index,
                    },
                    self.config.buffer_capacity,
                    Arc::downgrade(self),
                )
            }
            None => return None,
        };
        state.in_use.insert(buffer.id().index);
        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        Some(buffer)
    }

    fn exhausted(&self, state: &PoolState, context: &str) -> MessagingError {
        self.counters.exhaustions.fetch_add(1, Ordering::Relaxed);
        debug!(pool = self.id, in_use = state.in_use.len(), context, "Pool exhausted");
        MessagingError::pool_exhausted(state.in_use.len(), self.config.effective_max(), context)
    }

    /// Storage of a buffer that was dropped instead of released
    pub(crate) fn reclaim_dropped(self: Arc<Self>, id: BufferId, storage: Box<[u8]>, in_flight: bool) {
        let mut buffer = MessageBuffer::from_storage(id, storage, Arc::downgrade(&self));
        let mut state = self.state.lock();
        if !state.in_use.contains(&id.index) {
            buffer.detach();
            warn!(buffer = %id, "Dropped buffer was not checked out, discarding");
            return;
        }
        if in_flight {
            warn!(buffer = %id, "Dropped buffer is still in flight, quarantining");
            state.quarantined.push(buffer);
            return;
        }
        debug!(buffer = %id, "Returning dropped buffer to pool");
        state.in_use.remove(&id.index);
        state.free.push(buffer);
        drop(state);
        self.available.notify_one();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.in_use.is_empty() {
            warn!(
                pool = self.id,
                outstanding = state.in_use.len(),
                "Pool dropped with buffers still checked out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptp_codec::MessageHeader;
    use std::thread;

    fn fixed(buffers: usize) -> MessageBufferPool {
        MessageBufferPool::new(PoolConfig::fixed(buffers, 64)).unwrap()
    }

    #[test]
    fn test_acquire_release_conserves_buffers() {
        let pool = fixed(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.in_use_count(), 2);

        pool.release(a).unwrap();
        pool.release(b).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.free, 2);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.acquisitions, 2);
        assert_eq!(stats.releases, 2);
    }

    #[test]
    fn test_exhausted_non_blocking() {
        let pool = fixed(1);
        let held = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, MessagingError::PoolExhausted { in_use: 1, max: 1, .. }));
        assert!(pool.try_acquire().is_none());
        pool.release(held).unwrap();
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_released_buffer_is_reset() {
        let pool = fixed(1);
        let mut buf = pool.acquire().unwrap();
        buf.stage(b"stale", MessageHeader::new(0, 1, 2)).unwrap();
        pool.release(buf).unwrap();

        let buf = pool.acquire().unwrap();
        assert_eq!(buf.state(), BufferState::Free);
        assert!(buf.is_empty());
        assert!(buf.header().is_none());
    }

    #[test]
    fn test_growable_pool_grows_to_max() {
        let pool = MessageBufferPool::new(
            PoolConfig::growable(1, 3, 32).with_acquire(AcquirePolicy::NonBlocking),
        )
        .unwrap();
        assert_eq!(pool.total(), 1);

        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.total(), 3);
        assert_eq!(pool.stats().growths, 2);
        assert!(pool.acquire().is_err());

        for buf in held {
            pool.release(buf).unwrap();
        }
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_foreign_release_rejected() {
        let a = fixed(1);
        let b = fixed(1);
        let buf = a.acquire().unwrap();
        let err = b.release(buf).unwrap_err();
        assert!(matches!(err, MessagingError::ForeignBuffer { .. }));

        // The rejected buffer was dropped and found its way home
        assert_eq!(a.free_count(), 1);
        assert_eq!(a.in_use_count(), 0);
        assert_eq!(b.free_count(), 1);
    }

    #[test]
    fn test_double_release_detected() {
        let pool = fixed(2);
        let buf = pool.acquire().unwrap();
        let id = buf.id();
        pool.release(buf).unwrap();

        let forged = MessageBuffer::new(id, 64, Weak::new());
        let err = pool.release(forged).unwrap_err();
        assert_eq!(err, MessagingError::DoubleRelease { buffer: id });

        let stats = pool.stats();
        assert_eq!(stats.free, 2);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn test_in_flight_release_quarantines() {
        let pool = fixed(2);
        let mut buf = pool.acquire().unwrap();
        buf.stage(b"x", MessageHeader::new(0, 1, 1)).unwrap();
        buf.mark_in_flight().unwrap();

        let err = pool.release(buf).unwrap_err();
        assert!(matches!(err, MessagingError::BufferBusy { .. }));
        let stats = pool.stats();
        assert_eq!(stats.quarantined, 1);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.free, 1);

        assert_eq!(pool.reclaim_quarantined(), 1);
        let stats = pool.stats();
        assert_eq!(stats.quarantined, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.free, 2);
    }

    #[test]
    fn test_dropped_buffer_returns_to_pool() {
        let pool = fixed(1);
        {
            let mut buf = pool.acquire().unwrap();
            buf.stage(b"abc", MessageHeader::new(0, 1, 1)).unwrap();
        }
        assert_eq!(pool.free_count(), 1);
        let buf = pool.acquire().unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_shrink_only_touches_free_buffers() {
        let pool = MessageBufferPool::new(
            PoolConfig::growable(1, 4, 16).with_acquire(AcquirePolicy::NonBlocking),
        )
        .unwrap();
        let mut held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        let kept = held.pop().unwrap();
        for buf in held {
            pool.release(buf).unwrap();
        }
        assert_eq!(pool.free_count(), 3);

        assert_eq!(pool.shrink(0), 3);
        assert_eq!(pool.total(), 1);
        assert_eq!(pool.free_count(), 0);

        pool.release(kept).unwrap();
        assert_eq!(pool.total(), 1);
        assert_eq!(pool.free_count(), 1);

        // Capacity regrows after a shrink, with fresh slot indices
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.total(), 2);
    }

    #[test]
    fn test_acquire_for_checks_capacity() {
        let pool = fixed(1);
        assert!(pool.acquire_for(64).is_ok());
        assert!(matches!(
            pool.acquire_for(65),
            Err(MessagingError::BufferOverflow { requested: 65, .. })
        ));
    }

    #[test]
    fn test_acquire_timeout_expires() {
        let pool = fixed(1);
        let _held = pool.acquire().unwrap();
        let start = Instant::now();
        let err = pool.acquire_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, MessagingError::PoolExhausted { .. }));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(pool.stats().waits >= 1);
    }

    #[test]
    fn test_blocking_acquire_wakes_on_release() {
        let pool = MessageBufferPool::new(
            PoolConfig::fixed(1, 16).with_acquire(AcquirePolicy::Blocking { timeout_ms: None }),
        )
        .unwrap();
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let buf = pool.acquire().unwrap();
                pool.release(buf).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(20));
        pool.release(held).unwrap();
        waiter.join().unwrap();
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = MessageBufferPool::new(PoolConfig::fixed(0, 64)).err().unwrap();
        assert!(matches!(err, MessagingError::Configuration { .. }));
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = fixed(4);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        if let Some(buf) = pool.try_acquire() {
                            pool.release(buf).unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.free, 4);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.total, 4);
    }
}
