use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::runtime::{Handle, TryCurrentError};
use tracing::{error, trace};

use super::{
    events::{EventSink, NoopSink},
    session::Session,
    task::{execute, Task, Trajectory},
    Dispatcher,
};
use crate::config::PoolConfig;

/// Runs tasks on tokio's blocking pool, at most `workers` at a time.
/// Sessions with ready work are served round-robin, one task per turn.
pub struct PoolDispatcher<T: Task> {
    shared: Arc<Shared<T>>,
}

struct Shared<T: Task> {
    workers: usize,
    state: Mutex<PoolState<T>>,
    next_session: AtomicU64,
    events: Arc<dyn EventSink>,
    runtime: Handle,
}

struct PoolState<T: Task> {
    running: usize,
    ready: VecDeque<Session<T>>,
}

impl<T: Task> PoolDispatcher<T> {
    /// Must be called inside a tokio runtime.
    pub fn new(config: PoolConfig) -> Result<Self, TryCurrentError> {
        Self::with_events(config, Arc::new(NoopSink))
    }

    pub fn with_events(
        config: PoolConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, TryCurrentError> {
        Ok(Self {
            shared: Arc::new(Shared {
                workers: config.workers.max(1),
                state: Mutex::new(PoolState {
                    running: 0,
                    ready: VecDeque::new(),
                }),
                next_session: AtomicU64::new(0),
                events,
                runtime: Handle::try_current()?,
            }),
        })
    }

    /// Number of tasks executing right now.
    pub fn running(&self) -> usize {
        self.shared.state.lock().running
    }
}

impl<T: Task> Dispatcher<T> for PoolDispatcher<T> {
    fn new_session<F>(&self, expected: usize, consumer: F) -> Session<T>
    where
        F: FnMut(Trajectory<T::Output>) + Send + 'static,
    {
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        Session::new(id, expected, consumer)
    }

    fn submit(&self, session: &Session<T>, task: T) {
        session.push(task);
        {
            let mut state = self.shared.state.lock();
            if !state.ready.iter().any(|s| s.same_as(session)) {
                state.ready.push_back(session.clone());
            }
        }
        self.shared.pump();
    }
}

impl<T: Task> PoolState<T> {
    fn next_task(&mut self) -> Option<(Session<T>, T)> {
        while let Some(session) = self.ready.pop_front() {
            if let Some(task) = session.take(1).pop() {
                if session.has_pending() {
                    self.ready.push_back(session.clone());
                }
                return Some((session, task));
            }
        }
        None
    }
}

impl<T: Task> Shared<T> {
    /// Starts ready tasks until the pool is saturated or out of work.
    fn pump(self: &Arc<Self>) {
        loop {
            let (session, task) = {
                let mut state = self.state.lock();
                if state.running >= self.workers {
                    return;
                }
                match state.next_task() {
                    Some(next) => {
                        state.running += 1;
                        next
                    }
                    None => return,
                }
            };
            trace!(session = session.id(), "starting task");
            let shared = self.clone();
            self.runtime.spawn_blocking(move || {
                let executed = panic::catch_unwind(AssertUnwindSafe(|| execute(task)));
                shared.state.lock().running -= 1;
                let remaining = match executed {
                    Ok(trajectory) => session.fold(trajectory),
                    Err(_) => {
                        error!(session = session.id(), "task panicked, dropping it");
                        session.discard()
                    }
                };
                shared.events.on_progress(session.id(), remaining);
                shared.pump();
            });
        }
    }
}
