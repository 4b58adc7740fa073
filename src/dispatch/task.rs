use std::time::{Duration, Instant};

/// A unit of simulation work. Its inputs are opaque to every dispatcher;
/// running it consumes it.
pub trait Task: Send + 'static {
    type Output: Send + 'static;

    fn run(self) -> Outcome<Self::Output>;
}

/// What a task hands back when it finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub value: T,
    /// Whether the simulated trajectory reached its goal condition.
    pub reached_goal: bool,
}

impl<T> Outcome<T> {
    pub fn new(value: T, reached_goal: bool) -> Self {
        Self {
            value,
            reached_goal,
        }
    }
}

/// A finished task: its outcome plus the wall-clock time it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory<T> {
    pub value: T,
    pub elapsed: Duration,
    pub reached_goal: bool,
}

impl<T> Trajectory<T> {
    pub fn from_outcome(outcome: Outcome<T>, elapsed: Duration) -> Self {
        Self {
            value: outcome.value,
            elapsed,
            reached_goal: outcome.reached_goal,
        }
    }
}

/// Runs a task on the current thread and times it.
pub fn execute<T: Task>(task: T) -> Trajectory<T::Output> {
    let started = Instant::now();
    let outcome = task.run();
    Trajectory::from_outcome(outcome, started.elapsed())
}

/// Adapts a closure into a [`Task`].
pub struct FnTask<F>(pub F);

impl<F, O> Task for FnTask<F>
where
    F: FnOnce() -> Outcome<O> + Send + 'static,
    O: Send + 'static,
{
    type Output = O;

    fn run(self) -> Outcome<O> {
        (self.0)()
    }
}
