//! Serialized mutation with a message inbox.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

type Message<T> = Box<dyn FnOnce(&mut T) + Send>;

/// State guarded by an [`Exclusive`].
///
/// Operations on the state may produce outputs (for example, continuations
/// let go by a latch). Outputs are collected while the state is held and
/// delivered to the sink only after it is released, so the sink is free to
/// re-enter any execution context.
pub trait ExclusiveState: Send + 'static {
    /// Produced by operations, delivered after release.
    type Output: Send + 'static;

    /// Drains the outputs accumulated so far.
    fn take_output(&mut self) -> Vec<Self::Output>;
}

/// Runs operations on `T` one at a time, from any thread.
///
/// [`run`](Self::run) blocks until it holds the state. [`submit`](Self::submit)
/// never blocks: the message is queued and executed either immediately (if
/// the state is free) or by whichever thread currently holds it, before that
/// thread lets go. No message is lost and none runs concurrently with another
/// operation.
///
/// `run` must not be called re-entrantly for the same `Exclusive` from inside
/// one of its own operations or messages; use `submit` there.
pub struct Exclusive<T: ExclusiveState> {
    state: Mutex<T>,
    inbox: Mutex<VecDeque<Message<T>>>,
    sink: Arc<dyn Fn(Vec<T::Output>) + Send + Sync>,
}

impl<T: ExclusiveState> Exclusive<T> {
    /// Guards `state`, delivering outputs to `sink`.
    pub fn new(state: T, sink: impl Fn(Vec<T::Output>) + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(state),
            inbox: Mutex::new(VecDeque::new()),
            sink: Arc::new(sink),
        }
    }

    /// Runs `op` with exclusive access, then any messages that arrived meanwhile.
    pub fn run<R>(&self, op: impl FnOnce(&mut T) -> R) -> R {
        let (result, output) = {
            let mut state = self.state.lock();
            let result = op(&mut state);
            self.drain(&mut state);
            (result, state.take_output())
        };
        self.deliver(output);
        self.flush();
        result
    }

    /// Queues `message` and runs it now if nobody holds the state.
    pub fn submit(&self, message: impl FnOnce(&mut T) + Send + 'static) {
        self.inbox.lock().push_back(Box::new(message));
        self.flush();
    }

    /// Returns the number of queued messages.
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.inbox.lock().len()
    }

    fn flush(&self) {
        loop {
            if self.inbox.lock().is_empty() {
                return;
            }
            // The holder drains the inbox before releasing, and re-checks it
            // after, so a failed try_lock never strands a message.
            let Some(mut state) = self.state.try_lock() else {
                return;
            };
            self.drain(&mut state);
            let output = state.take_output();
            drop(state);
            self.deliver(output);
        }
    }

    fn drain(&self, state: &mut T) {
        while let Some(message) = self.next_message() {
            message(state);
        }
    }

    fn next_message(&self) -> Option<Message<T>> {
        self.inbox.lock().pop_front()
    }

    fn deliver(&self, output: Vec<T::Output>) {
        if !output.is_empty() {
            (self.sink)(output);
        }
    }
}
