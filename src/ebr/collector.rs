use super::collectible::{Batch, Link};

use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize};

/// The number of collectors in a [`Domain`](super::Domain).
pub const COLLECTOR_COUNT: usize = 16;

/// [`Collector`] holds the nodes retired while it was current.
///
/// The state word counts the threads that entered the domain while the collector was current
/// (`INNER_ONE` each), plus one reference owned by the master while the collector is current
/// (`IS_CURRENT`) and one owned by the previous collector until it drains (`BACK_LINK`). The
/// thread whose release brings the word to zero executes the list.
#[repr(align(128))]
pub(super) struct Collector {
    state: AtomicU64,
    deferred: AtomicPtr<Link>,
    len: AtomicUsize,
}

impl Collector {
    /// Reference held by the master while the collector is current.
    pub(super) const IS_CURRENT: u64 = 1;

    /// Reference held on behalf of the previous collector.
    pub(super) const BACK_LINK: u64 = 1 << 1;

    /// One thread counted in the collector.
    pub(super) const INNER_ONE: u64 = 1 << 8;

    /// The state a collector returns to after draining.
    const IDLE: u64 = Self::IS_CURRENT | Self::BACK_LINK;

    /// Creates a new [`Collector`]; only the first collector of a domain starts without a
    /// back link.
    pub(super) const fn new(first: bool) -> Self {
        Self {
            state: AtomicU64::new(if first {
                Self::IS_CURRENT
            } else {
                Self::IDLE
            }),
            deferred: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Moves a batch onto the shared list and returns the resulting length.
    pub(super) fn push(&self, batch: Batch) -> usize {
        if batch.is_empty() {
            return self.len.load(Relaxed);
        }
        let (head, tail, len) = (batch.head(), batch.tail(), batch.len());
        batch.forget();

        let mut current = self.deferred.load(Relaxed);
        loop {
            unsafe {
                (*tail).set_next(current);
            }
            match self
                .deferred
                .compare_exchange_weak(current, head, Release, Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.len.fetch_add(len, Relaxed) + len
    }

    /// Drops `amount` from the state word; returns `true` if the collector has to be drained.
    #[inline]
    pub(super) fn release(&self, amount: u64) -> bool {
        self.state.fetch_sub(amount, AcqRel) == amount
    }

    /// Converts the master's reference into the number of threads that entered the collector
    /// while it was current; returns `true` if all of them have already left.
    #[inline]
    pub(super) fn retire(&self, entered: u64) -> bool {
        let delta = entered
            .wrapping_mul(Self::INNER_ONE)
            .wrapping_sub(Self::IS_CURRENT);
        self.state.fetch_add(delta, AcqRel).wrapping_add(delta) == 0
    }

    /// Executes the shared list and makes the collector reusable.
    pub(super) fn drain(&self) -> usize {
        let head = self.deferred.swap(ptr::null_mut(), Acquire);
        self.len.store(0, Relaxed);
        let executed = unsafe { Link::execute_all(head) };
        self.state.store(Self::IDLE, Release);
        executed
    }

    /// Returns the number of nodes on the shared list.
    #[inline]
    pub(super) fn len(&self) -> usize {
        self.len.load(Relaxed)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        unsafe {
            Link::execute_all(*self.deferred.get_mut());
        }
    }
}
