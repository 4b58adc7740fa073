// A dispatcher takes independent simulation tasks, grouped into sessions,
// and runs them somewhere: inline on the caller's thread, on a bounded local
// pool, or on remote workers over TCP. Callers see the same contract in
// every case. They open a session, push tasks into it and wait for it to
// complete, and every finished task is handed to the session's consumer
// exactly once.

// Sessions are the unit of bookkeeping. Each one carries its own queue and
// counters behind its own lock, so dispatchers only coordinate which session
// is served next. Sessions are served round-robin; there are no priorities.

// The network backend is the interesting one. Every remote worker is
// trusted with a window of tasks per round, and that window follows TCP's
// congestion control: slow start, additive increase past a threshold,
// halving on overdue rounds and timeouts. A failed round never loses tasks,
// the batch goes back to the front of its session before the worker is
// re-checked on a fresh connection.
use std::future::Future;

pub mod events;
pub mod immediate;
pub mod net;
pub mod pool;
pub mod session;
pub mod task;

use session::Session;
use task::{Task, Trajectory};

/// The contract shared by every backend.
pub trait Dispatcher<T: Task>: Send + Sync {
    /// Opens a session expecting `expected` results. `consumer` is called
    /// once for every finished task, from whichever thread finished it.
    fn new_session<F>(&self, expected: usize, consumer: F) -> Session<T>
    where
        F: FnMut(Trajectory<T::Output>) + Send + 'static;

    /// Queues `task` in `session` and starts whatever work can start. Only
    /// the immediate backend runs the task before returning.
    fn submit(&self, session: &Session<T>, task: T);

    /// Resolves once `session` has no queued tasks, no running tasks and
    /// no outstanding expected results.
    fn await_completion(&self, session: &Session<T>) -> impl Future<Output = ()> + Send {
        session.wait()
    }
}
