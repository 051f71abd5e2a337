//! Latches: queues of continuations waiting on one condition.
//!
//! A [`ResourceLatch`] holds continuations until the condition they wait on
//! is released or fails. Release and failure hand back every waiting
//! continuation, in registration order, paired with a [`LatchOutcome`]. The
//! caller decides how to resume them; the latch never runs anything itself.
//!
//! A *permanent* release or failure also settles the latch for the future:
//! later registrations resolve immediately with the same outcome, and further
//! release or fail calls are ignored.
//!
//! Latches are plain data. They are only touched under the exclusive access of
//! the execution context that owns them, which is what makes "register, then
//! release" race-free across threads.
//!
//! # Example
//!
//! ```
//! use keel_system::latch::{LatchOutcome, ResourceLatch};
//!
//! let mut latch = ResourceLatch::new();
//! assert!(latch.register("first").is_none());
//! assert!(latch.register("second").is_none());
//!
//! let resumed = latch.release(true);
//! let order: Vec<_> = resumed.iter().map(|r| r.continuation).collect();
//! assert_eq!(order, vec!["first", "second"]);
//!
//! // Settled: new waiters proceed straight away.
//! let late = latch.register("late").unwrap();
//! assert!(matches!(late.outcome, LatchOutcome::Released));
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::Escalation;

/// How a waiting continuation was let go.
#[derive(Debug, Clone)]
pub enum LatchOutcome {
    /// The condition was met.
    Released,
    /// The condition failed with the carried cause.
    Failed(Escalation),
}

impl LatchOutcome {
    /// Returns the failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&Escalation> {
        match self {
            LatchOutcome::Released => None,
            LatchOutcome::Failed(cause) => Some(cause),
        }
    }
}

/// A continuation let go by a latch, with the reason.
#[derive(Debug)]
pub struct Resumed<C> {
    /// The continuation that was waiting.
    pub continuation: C,
    /// Why it was let go.
    pub outcome: LatchOutcome,
}

impl<C> Resumed<C> {
    /// Pairs a continuation with a released outcome.
    #[must_use]
    pub fn released(continuation: C) -> Self {
        Self {
            continuation,
            outcome: LatchOutcome::Released,
        }
    }

    /// Pairs a continuation with a failed outcome.
    #[must_use]
    pub fn failed(continuation: C, cause: Escalation) -> Self {
        Self {
            continuation,
            outcome: LatchOutcome::Failed(cause),
        }
    }
}

struct Waiting<C> {
    continuation: C,
    registered_at: Instant,
}

/// A FIFO of continuations waiting on one condition.
pub struct ResourceLatch<C> {
    waiting: VecDeque<Waiting<C>>,
    settled: Option<LatchOutcome>,
    last_failure: Option<Escalation>,
}

impl<C> Default for ResourceLatch<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ResourceLatch<C> {
    /// Creates an unsettled latch with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiting: VecDeque::new(),
            settled: None,
            last_failure: None,
        }
    }

    /// Registers a continuation to wait, timestamped now.
    ///
    /// Returns the continuation straight back if the latch is already
    /// permanently settled.
    pub fn register(&mut self, continuation: C) -> Option<Resumed<C>> {
        self.register_at(continuation, Instant::now())
    }

    /// Registers a continuation with an explicit registration time.
    pub fn register_at(&mut self, continuation: C, now: Instant) -> Option<Resumed<C>> {
        if let Some(outcome) = &self.settled {
            return Some(Resumed {
                continuation,
                outcome: outcome.clone(),
            });
        }
        self.waiting.push_back(Waiting {
            continuation,
            registered_at: now,
        });
        None
    }

    /// Releases every waiter, oldest first.
    ///
    /// With `permanent`, the latch stays released for future registrations.
    /// Ignored once the latch is permanently settled.
    pub fn release(&mut self, permanent: bool) -> Vec<Resumed<C>> {
        self.settle(LatchOutcome::Released, permanent)
    }

    /// Fails every waiter with `cause`, oldest first.
    ///
    /// With `permanent`, future registrations fail immediately with the same
    /// cause. Ignored once the latch is permanently settled.
    pub fn fail(&mut self, cause: Escalation, permanent: bool) -> Vec<Resumed<C>> {
        if self.settled.is_none() {
            self.last_failure = Some(cause.clone());
        }
        self.settle(LatchOutcome::Failed(cause), permanent)
    }

    /// Permanently fails the latch if its oldest waiter registered more than
    /// `timeout` before `now`.
    ///
    /// The cause is built lazily so callers can name what timed out.
    pub fn expire(
        &mut self,
        now: Instant,
        timeout: Duration,
        cause: impl FnOnce() -> Escalation,
    ) -> Vec<Resumed<C>> {
        let expired = self
            .oldest_registration()
            .is_some_and(|registered| now.saturating_duration_since(registered) > timeout);
        if expired {
            self.fail(cause(), true)
        } else {
            Vec::new()
        }
    }

    /// Returns `true` if any continuation is waiting.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        !self.waiting.is_empty()
    }

    /// Returns the number of waiting continuations.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Returns when the longest-waiting continuation registered.
    #[must_use]
    pub fn oldest_registration(&self) -> Option<Instant> {
        self.waiting.front().map(|waiting| waiting.registered_at)
    }

    /// Returns `true` once permanently released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        matches!(self.settled, Some(LatchOutcome::Released))
    }

    /// Returns `true` once permanently failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.settled, Some(LatchOutcome::Failed(_)))
    }

    /// Returns the most recent failure cause, permanent or not.
    #[must_use]
    pub fn failure(&self) -> Option<&Escalation> {
        self.last_failure.as_ref()
    }

    fn settle(&mut self, outcome: LatchOutcome, permanent: bool) -> Vec<Resumed<C>> {
        if self.settled.is_some() {
            return Vec::new();
        }
        let resumed = self
            .waiting
            .drain(..)
            .map(|waiting| Resumed {
                continuation: waiting.continuation,
                outcome: outcome.clone(),
            })
            .collect();
        if permanent {
            self.settled = Some(outcome);
        }
        resumed
    }
}
