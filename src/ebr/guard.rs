use super::collectible::deferred;
use super::domain::Domain;
use super::participant::Participant;

use std::sync::Arc;

/// [`Guard`] keeps every resource loaded while it is alive from being reclaimed.
///
/// A [`Guard`] is obtained from [`Participant::acquire`] and is bound to the thread of its
/// participant.
#[derive(Debug)]
pub struct Guard<'p> {
    participant: &'p Participant,
}

impl<'p> Guard<'p> {
    #[inline]
    pub(super) fn new(participant: &'p Participant) -> Self {
        Self { participant }
    }

    /// Declares that the thread holds nothing it loaded through this guard.
    ///
    /// If the thread retired something, asked for a promotion, or the current collector moved
    /// on, the local list is flushed and the thread re-enters the current collector. The method
    /// does nothing while nested guards are alive.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::ebr::{Domain, ThreadState};
    ///
    /// let domain = Domain::new();
    /// let participant = domain.register();
    ///
    /// let mut guard = participant.acquire();
    /// guard.quiescent();
    /// assert_eq!(participant.state(), ThreadState::Quiescent { collector: 0 });
    /// ```
    #[inline]
    pub fn quiescent(&mut self) {
        self.participant.quiescent();
    }

    /// Drops the boxed value once every thread that might still see it has left.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::ebr::Domain;
    ///
    /// let domain = Domain::new();
    /// let participant = domain.register();
    ///
    /// let guard = participant.acquire();
    /// guard.defer(Box::new(String::from("retired")));
    /// assert_eq!(participant.local_pending(), 1);
    /// ```
    #[inline]
    pub fn defer<T: Send + 'static>(&self, boxed: Box<T>) {
        self.defer_execute(move || drop(boxed));
    }

    /// Executes the closure once every thread that might still see the resources it touches has
    /// left.
    #[inline]
    pub fn defer_execute<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.participant.defer(deferred(f));
    }

    /// Asks for the current collector to be advanced at the next flush.
    #[inline]
    pub fn promote(&self) {
        self.participant.promote();
    }

    /// Returns the [`Domain`] of the guard.
    #[inline]
    pub fn domain(&self) -> &Arc<Domain> {
        self.participant.domain()
    }

    /// Returns the [`Participant`] of the guard.
    #[inline]
    pub fn participant(&self) -> &'p Participant {
        self.participant
    }
}

impl Drop for Guard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.participant.release();
    }
}
