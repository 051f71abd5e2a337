//! Process outcomes.
//!
//! Every invoked process reports exactly one [`ProcessOutcome`]. The first
//! decision wins; later attempts (a normal completion racing a fatal
//! failure, for instance) are ignored.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use keel_system::context::ProcessId;
use keel_system::error::{Escalation, ResourceError};
use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

/// How a process ended.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// Every thread completed, possibly after handled escalations.
    Completed,
    /// An escalation reached no handler.
    Failed(Escalation),
}

impl ProcessOutcome {
    /// Returns `true` for [`ProcessOutcome::Completed`].
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, ProcessOutcome::Completed)
    }

    /// Returns the failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&Escalation> {
        match self {
            ProcessOutcome::Completed => None,
            ProcessOutcome::Failed(cause) => Some(cause),
        }
    }
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessOutcome::Completed => write!(f, "completed"),
            ProcessOutcome::Failed(cause) => write!(f, "failed: {cause}"),
        }
    }
}

/// Shared between a process's steps and its handle.
pub(crate) struct ProcessControl {
    id: ProcessId,
    failed: AtomicBool,
    steps: AtomicUsize,
    outcome: Mutex<Option<ProcessOutcome>>,
    decided: Condvar,
    sender: Mutex<Option<oneshot::Sender<ProcessOutcome>>>,
}

impl ProcessControl {
    pub(crate) fn new(id: ProcessId) -> (Arc<Self>, ProcessHandle) {
        let (sender, receiver) = oneshot::channel();
        let control = Arc::new(Self {
            id: id.clone(),
            failed: AtomicBool::new(false),
            steps: AtomicUsize::new(0),
            outcome: Mutex::new(None),
            decided: Condvar::new(),
            sender: Mutex::new(Some(sender)),
        });
        let handle = ProcessHandle {
            id,
            control: Arc::clone(&control),
            receiver: Some(receiver),
        };
        (control, handle)
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Counts one step and returns the running total.
    pub(crate) fn count_step(&self) -> usize {
        self.steps.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Records a fatal failure. Returns `false` if an outcome was already decided.
    pub(crate) fn fail(&self, cause: Escalation) -> bool {
        self.failed.store(true, Ordering::Release);
        self.decide(ProcessOutcome::Failed(cause))
    }

    /// Records normal completion. Returns `false` if an outcome was already decided.
    pub(crate) fn complete(&self) -> bool {
        self.decide(ProcessOutcome::Completed)
    }

    fn outcome(&self) -> Option<ProcessOutcome> {
        self.outcome.lock().clone()
    }

    fn decide(&self, outcome: ProcessOutcome) -> bool {
        {
            let mut slot = self.outcome.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome.clone());
            self.decided.notify_all();
        }
        tracing::debug!(process = %self.id, %outcome, "process outcome decided");
        if let Some(sender) = self.sender.lock().take() {
            // The handle may have been dropped.
            let _ = sender.send(outcome);
        }
        true
    }
}

/// Returned by [`Office::invoke_process`](crate::office::Office::invoke_process);
/// observes the process's single outcome.
///
/// Dropping the handle does not stop the process.
pub struct ProcessHandle {
    id: ProcessId,
    control: Arc<ProcessControl>,
    receiver: Option<oneshot::Receiver<ProcessOutcome>>,
}

impl ProcessHandle {
    /// Returns the process identifier.
    #[must_use]
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    /// Returns the outcome if the process has ended.
    #[must_use]
    pub fn try_outcome(&self) -> Option<ProcessOutcome> {
        self.control.outcome()
    }

    /// Returns `true` once the process has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.control.outcome.lock().is_some()
    }

    /// Blocks the calling thread until the process ends.
    ///
    /// Must not be called from a worker of a team the process runs on.
    #[must_use]
    pub fn wait(&self) -> ProcessOutcome {
        let mut slot = self.control.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.control.decided.wait(&mut slot);
        }
    }

    /// Blocks for at most `timeout`; `None` if the process is still running.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ProcessOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.control.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Some(outcome.clone());
            }
            if self.control.decided.wait_until(&mut slot, deadline).timed_out() {
                return slot.clone();
            }
        }
    }

    /// Resolves when the process ends.
    pub async fn completion(mut self) -> ProcessOutcome {
        if let Some(receiver) = self.receiver.take()
            && let Ok(outcome) = receiver.await
        {
            return outcome;
        }
        self.control.outcome().unwrap_or_else(|| {
            ProcessOutcome::Failed(ResourceError::ShuttingDown(self.id.to_string()).into())
        })
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("outcome", &self.try_outcome())
            .finish()
    }
}
