use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use super::{
    events::{EventSink, NoopSink},
    session::Session,
    task::{execute, Task, Trajectory},
    Dispatcher,
};

/// Runs every task on the submitting thread before `submit` returns.
/// Useful for debugging and for tests that need a deterministic order.
///
/// A consumer may submit to its own session. The nested call only queues
/// the task and the outer `submit` runs it once the consumer returns.
pub struct ImmediateDispatcher {
    next_session: AtomicU64,
    events: Arc<dyn EventSink>,
}

impl ImmediateDispatcher {
    pub fn new() -> Self {
        Self::with_events(Arc::new(NoopSink))
    }

    pub fn with_events(events: Arc<dyn EventSink>) -> Self {
        Self {
            next_session: AtomicU64::new(0),
            events,
        }
    }
}

impl Default for ImmediateDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Task> Dispatcher<T> for ImmediateDispatcher {
    fn new_session<F>(&self, expected: usize, consumer: F) -> Session<T>
    where
        F: FnMut(Trajectory<T::Output>) + Send + 'static,
    {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        Session::new(id, expected, consumer)
    }

    fn submit(&self, session: &Session<T>, task: T) {
        session.push(task);
        // the queue is checked again after releasing the drain, a concurrent
        // submit may have queued a task it was not allowed to run
        while session.has_pending() && session.begin_drain() {
            while let Some(task) = session.take(1).pop() {
                let remaining = session.fold(execute(task));
                self.events.on_progress(session.id(), remaining);
            }
            session.end_drain();
        }
    }
}
