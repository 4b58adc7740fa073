pub mod config;
pub mod dispatch;

pub use dispatch::{
    events::{EventSink, NoopSink, TracingSink},
    immediate::ImmediateDispatcher,
    pool::PoolDispatcher,
    session::{Session, SessionId},
    task::{execute, FnTask, Outcome, Task, Trajectory},
    Dispatcher,
};
