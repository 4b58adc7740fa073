use std::net::SocketAddr;

use tracing::{debug, info};

use super::{net::tracker::WorkerState, session::SessionId};

/// Receives progress and worker-state notifications from a dispatcher.
///
/// Callbacks are made synchronously from whichever thread observed the
/// change, so implementations should return quickly.
pub trait EventSink: Send + Sync + 'static {
    /// A result of `session` was folded; `remaining` results are still
    /// expected.
    fn on_progress(&self, _session: SessionId, _remaining: usize) {}

    /// A remote worker changed lifecycle state.
    fn on_worker_state(&self, _worker: SocketAddr, _state: WorkerState) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_progress(&self, session: SessionId, remaining: usize) {
        debug!(session, remaining, "session progress");
    }

    fn on_worker_state(&self, worker: SocketAddr, state: WorkerState) {
        info!(%worker, ?state, "worker state changed");
    }
}
