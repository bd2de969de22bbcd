use super::collectible::{Batch, Link};
use super::domain::Domain;
use super::guard::Guard;

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

/// Whether a [`Participant`] is counted in a collector, and which one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Not counted in any collector.
    Idle,
    /// Counted in `collector`; resources loaded under the current [`Guard`] may be in use.
    Acquired { collector: usize },
    /// Counted in `collector`, having declared that it holds nothing loaded before its last
    /// quiescent point.
    Quiescent { collector: usize },
}

impl ThreadState {
    /// Returns the collector the thread is counted in.
    #[inline]
    pub fn collector(self) -> Option<usize> {
        match self {
            ThreadState::Idle => None,
            ThreadState::Acquired { collector } | ThreadState::Quiescent { collector } => {
                Some(collector)
            }
        }
    }
}

/// [`Participant`] is the per-thread handle of a [`Domain`].
///
/// A participant is bound to the thread that created it, and is neither [`Send`] nor [`Sync`].
pub struct Participant {
    domain: Arc<Domain>,
    record: RefCell<Record>,
    _thread_bound: PhantomData<*const ()>,
}

struct Record {
    depth: usize,
    state: ThreadState,
    local: Batch,
    promote: bool,
}

impl Participant {
    pub(super) fn new(domain: Arc<Domain>) -> Self {
        Self {
            domain,
            record: RefCell::new(Record {
                depth: 0,
                state: ThreadState::Idle,
                local: Batch::new(),
                promote: false,
            }),
            _thread_bound: PhantomData,
        }
    }

    /// Enters the domain, returning a [`Guard`] that keeps every resource loaded through it
    /// alive.
    ///
    /// Acquiring is reentrant: nested guards share the collector of the outermost one, and only
    /// dropping the outermost guard leaves the domain.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::ebr::{Domain, ThreadState};
    ///
    /// let domain = Domain::new();
    /// let participant = domain.register();
    ///
    /// let outer = participant.acquire();
    /// let inner = participant.acquire();
    /// drop(inner);
    /// assert_eq!(participant.state(), ThreadState::Acquired { collector: 0 });
    /// drop(outer);
    /// assert_eq!(participant.state(), ThreadState::Idle);
    /// ```
    #[inline]
    pub fn acquire(&self) -> Guard<'_> {
        let mut record = self.record.borrow_mut();
        record.depth += 1;
        if record.depth == 1 {
            let collector = self.domain.enter();
            record.state = ThreadState::Acquired { collector };
        }
        drop(record);
        Guard::new(self)
    }

    /// Returns the current state of the participant.
    #[inline]
    pub fn state(&self) -> ThreadState {
        self.record.borrow().state
    }

    /// Returns the number of live guards.
    #[inline]
    pub fn depth(&self) -> usize {
        self.record.borrow().depth
    }

    /// Returns the number of deferred nodes that have not been flushed yet.
    #[inline]
    pub fn local_pending(&self) -> usize {
        self.record.borrow().local.len()
    }

    /// Returns the [`Domain`] of the participant.
    #[inline]
    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    pub(super) fn defer(&self, link: *mut Link) {
        let mut record = self.record.borrow_mut();
        debug_assert!(record.depth > 0);
        record.local.push(link);
        if let ThreadState::Quiescent { collector } = record.state {
            record.state = ThreadState::Acquired { collector };
        }
    }

    pub(super) fn promote(&self) {
        self.record.borrow_mut().promote = true;
    }

    /// Declares a quiescent point of the outermost guard.
    pub(super) fn quiescent(&self) {
        let mut record = self.record.borrow_mut();
        if record.depth != 1 {
            return;
        }
        let Some(collector) = record.state.collector() else {
            return;
        };
        if record.local.is_empty()
            && !record.promote
            && self.domain.current_collector() == collector
        {
            record.state = ThreadState::Quiescent { collector };
            return;
        }

        let local = record.local.take();
        let promote = mem::take(&mut record.promote);
        drop(record);

        self.flush(local, promote);
        self.domain.leave(collector);
        let collector = self.domain.enter();
        self.record.borrow_mut().state = ThreadState::Quiescent { collector };
    }

    /// Drops one guard; the outermost one flushes the local list and leaves the domain.
    pub(super) fn release(&self) {
        let mut record = self.record.borrow_mut();
        debug_assert!(record.depth > 0);
        record.depth -= 1;
        if record.depth != 0 {
            return;
        }
        let Some(collector) = record.state.collector() else {
            return;
        };
        let local = record.local.take();
        let promote = mem::take(&mut record.promote);
        record.state = ThreadState::Idle;
        drop(record);

        self.flush(local, promote);
        self.domain.leave(collector);
    }

    fn flush(&self, local: Batch, promote: bool) {
        if local.is_empty() && !promote {
            return;
        }
        let (current, pending) = self.domain.flush(local);
        if promote || pending > self.domain.threshold() {
            self.domain.try_advance(current);
        }
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("state", &self.state())
            .field("depth", &self.depth())
            .finish()
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        let record = self.record.get_mut();
        let local = record.local.take();
        let promote = mem::take(&mut record.promote);
        let state = mem::replace(&mut record.state, ThreadState::Idle);
        record.depth = 0;
        if let Some(collector) = state.collector() {
            // A guard was leaked; the thread must not stay counted forever.
            self.flush(local, promote);
            self.domain.leave(collector);
        }
    }
}
