use super::collectible::Batch;
use super::collector::{Collector, COLLECTOR_COUNT};
use super::participant::Participant;
use crate::config::DEFAULT_RECLAIM_THRESHOLD;

use std::fmt;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, SeqCst};
use std::sync::atomic::{fence, AtomicU64, AtomicUsize};
use std::sync::Arc;

/// [`Domain`] is a reclamation domain shared by every participant that touches the same data
/// structures.
///
/// # Examples
///
/// ```
/// use stripemap::ebr::Domain;
///
/// let domain = Domain::with_threshold(0);
/// let participant = domain.register();
///
/// let guard = participant.acquire();
/// guard.defer(Box::new([0_u8; 64]));
/// drop(guard);
///
/// assert_eq!(domain.current_collector(), 1);
/// ```
pub struct Domain {
    master: AtomicU64,
    collectors: [Collector; COLLECTOR_COUNT],
    threshold: usize,
    reclaimed: AtomicUsize,
}

/// [`MasterState`] is the decoded master word.
///
/// Bits `0..4` hold the index of the current collector, bits `4..8` the index of the oldest
/// collector that has not drained yet, and the remaining bits count the threads that entered the
/// current collector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct MasterState(u64);

impl MasterState {
    const INDEX_BITS: u64 = (1 << 4) - 1;
    const TAIL_SHIFT: u32 = 4;
    const OUTER_SHIFT: u32 = 8;
    const OUTER_ONE: u64 = 1 << Self::OUTER_SHIFT;

    #[inline]
    fn current(self) -> usize {
        (self.0 & Self::INDEX_BITS) as usize
    }

    #[inline]
    fn tail(self) -> usize {
        ((self.0 >> Self::TAIL_SHIFT) & Self::INDEX_BITS) as usize
    }

    #[inline]
    fn outer(self) -> u64 {
        self.0 >> Self::OUTER_SHIFT
    }

    /// The current collector moves forward and the outer count restarts from zero.
    #[inline]
    fn advanced(self) -> MasterState {
        let next = next_index(self.current()) as u64;
        MasterState((self.0 & (Self::INDEX_BITS << Self::TAIL_SHIFT)) | next)
    }

    #[inline]
    fn tail_advanced(self) -> MasterState {
        let next = next_index(self.tail()) as u64;
        MasterState(
            (self.0 & !(Self::INDEX_BITS << Self::TAIL_SHIFT)) | (next << Self::TAIL_SHIFT),
        )
    }
}

const _: () = assert!(COLLECTOR_COUNT as u64 == MasterState::INDEX_BITS + 1);

#[inline]
fn next_index(index: usize) -> usize {
    (index + 1) % COLLECTOR_COUNT
}

impl Domain {
    /// Creates a new [`Domain`] with the default reclamation threshold.
    #[inline]
    #[must_use]
    pub fn new() -> Arc<Domain> {
        Self::with_threshold(DEFAULT_RECLAIM_THRESHOLD)
    }

    /// Creates a new [`Domain`] that asks for an epoch advance once a collector holds more than
    /// `threshold` deferred nodes.
    #[must_use]
    pub fn with_threshold(threshold: usize) -> Arc<Domain> {
        Arc::new(Domain {
            master: AtomicU64::new(0),
            collectors: std::array::from_fn(|index| Collector::new(index == 0)),
            threshold,
            reclaimed: AtomicUsize::new(0),
        })
    }

    /// Registers a new [`Participant`] for the calling thread.
    #[inline]
    #[must_use]
    pub fn register(self: &Arc<Self>) -> Participant {
        Participant::new(self.clone())
    }

    /// Returns the index of the current collector.
    #[inline]
    pub fn current_collector(&self) -> usize {
        MasterState(self.master.load(Acquire)).current()
    }

    /// Returns the index of the oldest collector that has not drained yet.
    #[inline]
    pub fn collector_tail(&self) -> usize {
        MasterState(self.master.load(Acquire)).tail()
    }

    /// Returns the number of deferred nodes executed so far.
    #[inline]
    pub fn reclaimed(&self) -> usize {
        self.reclaimed.load(Acquire)
    }

    /// Returns the number of flushed nodes waiting for their collector to drain.
    pub fn pending(&self) -> usize {
        self.collectors.iter().map(Collector::len).sum()
    }

    /// Returns the reclamation threshold.
    #[inline]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Counts the calling thread in the current collector and returns its index.
    pub(super) fn enter(&self) -> usize {
        let previous = MasterState(self.master.fetch_add(MasterState::OUTER_ONE, SeqCst));
        // Loads of shared pointers must not be reordered before the announcement.
        fence(SeqCst);
        previous.current()
    }

    /// Removes the calling thread from the collector it entered.
    #[inline]
    pub(super) fn leave(&self, collector: usize) {
        self.release(collector, Collector::INNER_ONE);
    }

    /// Moves a batch onto the current collector, and returns the index of the collector and its
    /// resulting length.
    pub(super) fn flush(&self, batch: Batch) -> (usize, usize) {
        // Every retired resource has to be unreachable before the current collector is read.
        fence(SeqCst);
        let current = MasterState(self.master.load(SeqCst)).current();
        let len = self.collectors[current].push(batch);
        (current, len)
    }

    /// Makes the collector after `observed` current, if `observed` is still current and the ring
    /// is not full.
    pub(super) fn try_advance(&self, observed: usize) -> bool {
        let mut state = MasterState(self.master.load(Acquire));
        loop {
            if state.current() != observed || state.tail() == next_index(observed) {
                return false;
            }
            match self
                .master
                .compare_exchange(state.0, state.advanced().0, AcqRel, Acquire)
            {
                Ok(_) => break,
                Err(actual) => state = MasterState(actual),
            }
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(collector = observed, entered = state.outer(), "collector retired");

        if self.collectors[observed].retire(state.outer()) {
            self.drain_from(observed);
        }
        true
    }

    fn release(&self, collector: usize, amount: u64) {
        if self.collectors[collector].release(amount) {
            self.drain_from(collector);
        }
    }

    /// Drains `collector` and every following collector whose last reference was the back link.
    fn drain_from(&self, mut collector: usize) {
        loop {
            let executed = self.collectors[collector].drain();
            self.reclaimed.fetch_add(executed, AcqRel);
            let _ = self.master.fetch_update(AcqRel, Acquire, |state| {
                Some(MasterState(state).tail_advanced().0)
            });

            #[cfg(feature = "tracing")]
            tracing::trace!(collector, executed, "collector drained");

            collector = next_index(collector);
            if !self.collectors[collector].release(Collector::BACK_LINK) {
                break;
            }
        }
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = MasterState(self.master.load(Relaxed));
        f.debug_struct("Domain")
            .field("current", &state.current())
            .field("tail", &state.tail())
            .field("entered", &state.outer())
            .field("pending", &self.pending())
            .field("reclaimed", &self.reclaimed())
            .finish()
    }
}
