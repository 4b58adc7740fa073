use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::watch;

use super::task::{Task, Trajectory};

pub type SessionId = u64;

type Consumer<O> = Box<dyn FnMut(Trajectory<O>) + Send>;

/// A batch of tasks sharing one result consumer and one completion point.
///
/// Can be cloned to obtain another handle to the same session.
pub struct Session<T: Task> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: Task> {
    id: SessionId,
    state: Mutex<State<T>>,
    // kept apart from `state` so a consumer may read the session's counters
    consumer: Mutex<Consumer<T::Output>>,
    // set while a thread runs this session's queue on its own stack
    draining: AtomicBool,
    completed: watch::Sender<bool>,
}

struct State<T> {
    pending: VecDeque<T>,
    expected: usize,
    reached: u64,
    running: usize,
}

impl<T> State<T> {
    fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.expected == 0 && self.running == 0
    }
}

impl<T: Task> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Task> Session<T> {
    pub(crate) fn new<F>(id: SessionId, expected: usize, consumer: F) -> Self
    where
        F: FnMut(Trajectory<T::Output>) + Send + 'static,
    {
        let (completed, _) = watch::channel(expected == 0);
        Self {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    expected,
                    reached: 0,
                    running: 0,
                }),
                consumer: Mutex::new(Box::new(consumer)),
                draining: AtomicBool::new(false),
                completed,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Number of results the session is still waiting for.
    pub fn expected(&self) -> usize {
        self.inner.state.lock().expected
    }

    /// Number of completed tasks whose trajectory reached its goal.
    pub fn reached(&self) -> u64 {
        self.inner.state.lock().reached
    }

    /// Number of tasks queued but not yet handed to an executor.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Number of tasks currently executing, locally or remotely.
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().is_complete()
    }

    /// Resolves once the session is complete.
    ///
    /// The returned future does not borrow the session, so it can be moved
    /// into a spawned task.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut completed = self.inner.completed.subscribe();
        async move {
            // the sender lives as long as the session, an error means the
            // session is gone and there is nothing left to wait for
            let _ = completed.wait_for(|done| *done).await;
        }
    }

    /// Accounts for one result without running the consumer.
    pub fn task_completed(&self) {
        let mut state = self.inner.state.lock();
        state.expected = state.expected.saturating_sub(1);
        self.refresh(&state);
    }

    pub fn increment_reach(&self) {
        self.inner.state.lock().reached += 1;
    }

    pub(crate) fn push(&self, task: T) {
        let mut state = self.inner.state.lock();
        state.pending.push_back(task);
        self.refresh(&state);
    }

    /// Removes up to `count` tasks from the front of the queue and counts
    /// them as running.
    pub(crate) fn take(&self, count: usize) -> Vec<T> {
        let mut state = self.inner.state.lock();
        let count = count.min(state.pending.len());
        let batch: Vec<T> = state.pending.drain(..count).collect();
        state.running += batch.len();
        batch
    }

    /// Puts a batch that could not be executed back at the front of the
    /// queue, in its original order.
    pub(crate) fn requeue(&self, batch: Vec<T>) {
        let mut state = self.inner.state.lock();
        state.running = state.running.saturating_sub(batch.len());
        for task in batch.into_iter().rev() {
            state.pending.push_front(task);
        }
        self.refresh(&state);
    }

    /// Hands a finished trajectory to the consumer and updates the counters.
    /// Returns the number of results still expected.
    pub(crate) fn fold(&self, trajectory: Trajectory<T::Output>) -> usize {
        let reached_goal = trajectory.reached_goal;
        {
            let mut consumer = self.inner.consumer.lock();
            (*consumer)(trajectory);
        }

        let mut state = self.inner.state.lock();
        state.running = state.running.saturating_sub(1);
        state.expected = state.expected.saturating_sub(1);
        if reached_goal {
            state.reached += 1;
        }
        self.refresh(&state);
        state.expected
    }

    /// Gives up on a task taken from the queue. It counts as delivered but
    /// the consumer never sees it. Returns the number of results still
    /// expected.
    pub(crate) fn discard(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.running = state.running.saturating_sub(1);
        state.expected = state.expected.saturating_sub(1);
        self.refresh(&state);
        state.expected
    }

    /// Claims the right to run this session's queue on the calling thread.
    /// Returns `false` if another caller, possibly further up the same
    /// stack, already holds it.
    pub(crate) fn begin_drain(&self) -> bool {
        !self.inner.draining.swap(true, Ordering::Acquire)
    }

    pub(crate) fn end_drain(&self) {
        self.inner.draining.store(false, Ordering::Release);
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.inner.state.lock().pending.is_empty()
    }

    pub(crate) fn same_as(&self, other: &Session<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // must be called with the state lock held so waiters never miss a change
    fn refresh(&self, state: &State<T>) {
        let complete = state.is_complete();
        self.inner.completed.send_if_modified(|done| {
            let changed = *done != complete;
            *done = complete;
            changed
        });
    }
}
