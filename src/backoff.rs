use std::hint;
use std::thread;

use crate::config::SpinPolicy;

/// [`Backoff`] escalates from spinning to yielding to sleeping according to a [`SpinPolicy`].
pub(crate) struct Backoff<'p> {
    policy: &'p SpinPolicy,
    attempt: u32,
}

/// What the most recent [`Backoff::snooze`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BackoffAction {
    /// Executed a spin-loop hint.
    Spin,
    /// Yielded the time slice.
    Yield,
    /// Slept for the configured duration.
    Sleep,
}

impl<'p> Backoff<'p> {
    #[inline]
    pub(crate) const fn new(policy: &'p SpinPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Waits once, escalating with the number of previous attempts.
    #[inline]
    pub(crate) fn snooze(&mut self) -> BackoffAction {
        let action = self.next_action();
        match action {
            BackoffAction::Spin => hint::spin_loop(),
            BackoffAction::Yield => thread::yield_now(),
            BackoffAction::Sleep => thread::sleep(self.policy.sleep),
        }
        self.attempt = self.attempt.saturating_add(1);
        action
    }

    /// Forgets previous attempts.
    #[inline]
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_action(&self) -> BackoffAction {
        if self.attempt < self.policy.spin_limit {
            BackoffAction::Spin
        } else if self.attempt - self.policy.spin_limit < self.policy.yield_limit {
            BackoffAction::Yield
        } else {
            BackoffAction::Sleep
        }
    }
}
