//! Adaptive admission control for remote workers.
//!
//! Every worker gets a window of tasks it is trusted to receive in a single
//! round. The window grows like TCP slow start while rounds come back in
//! time, switches to additive increase past [`SLOW_START_LIMIT`], and is
//! halved whenever a round is overdue or the connection times out. The
//! per-task round trip time is smoothed the same way TCP smooths its RTT
//! samples, and those estimates decide both the read deadline of the next
//! round and whether a batch is too large to ever finish.

use std::{net::SocketAddr, time::Duration};

use crate::config::TrackerConfig;

use super::channel::ChannelId;

/// Weight of a new RTT sample in the smoothed estimate.
pub const ALPHA: f64 = 0.125;
/// Weight of a new deviation sample in the smoothed deviation.
pub const BETA: f64 = 0.25;
/// Window size past which the window grows by one instead of doubling.
pub const SLOW_START_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Receiving batches.
    Active,
    /// A round failed and the worker is being re-checked on a new
    /// connection.
    Probing,
    /// The re-check failed. Terminal.
    Removed,
}

/// A point-in-time copy of a tracker, for callers outside the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSnapshot {
    pub addr: SocketAddr,
    pub state: WorkerState,
    pub expected_tasks: usize,
    pub estimated_rtt: Duration,
    pub dev_rtt: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct WorkerTracker {
    addr: SocketAddr,
    channel: ChannelId,
    expected_tasks: usize,
    // seconds per task
    estimated_rtt: f64,
    // `None` until the first sample arrives
    dev_rtt: Option<f64>,
    last_sent: usize,
    last_elapsed: Duration,
    state: WorkerState,
    config: TrackerConfig,
}

impl WorkerTracker {
    pub fn new(addr: SocketAddr, channel: ChannelId, config: TrackerConfig) -> Self {
        Self {
            addr,
            channel,
            expected_tasks: 1,
            estimated_rtt: 0.0,
            dev_rtt: None,
            last_sent: 0,
            last_elapsed: Duration::ZERO,
            state: WorkerState::Active,
            config,
        }
    }

    /// Folds in a successful round of `tasks_sent` tasks that took `elapsed`.
    pub fn update(&mut self, tasks_sent: usize, elapsed: Duration) {
        if tasks_sent == 0 {
            return;
        }
        self.last_sent = tasks_sent;
        self.last_elapsed = elapsed;

        let sample = elapsed.as_secs_f64() / tasks_sent as f64;
        match self.dev_rtt {
            None => {
                self.estimated_rtt = sample;
                self.dev_rtt = Some(2.0 * sample);
                self.expected_tasks = 2;
            }
            Some(dev) => {
                self.estimated_rtt = ALPHA * sample + (1.0 - ALPHA) * self.estimated_rtt;
                self.dev_rtt = Some(
                    BETA * (sample - self.estimated_rtt).abs() + (1.0 - BETA) * dev,
                );
                if elapsed >= self.time_limit(self.expected_tasks) {
                    self.halve();
                } else if self.expected_tasks < SLOW_START_LIMIT {
                    self.expected_tasks *= 2;
                } else {
                    self.expected_tasks += 1;
                }
            }
        }
    }

    /// The deadline past which a batch of `tasks` is overdue.
    pub fn time_limit(&self, tasks: usize) -> Duration {
        let n = tasks as f64;
        seconds(n * self.estimated_rtt + n * self.dev())
    }

    /// Read deadline of the next round. Unbounded while the window is one.
    pub fn timeout(&self) -> Option<Duration> {
        if self.expected_tasks > 1 {
            let n = self.expected_tasks as f64;
            Some(seconds(
                n * self.estimated_rtt
                    + n * self.config.timeout_deviation_factor * self.dev(),
            ))
        } else {
            None
        }
    }

    /// Whether a batch of `tasks` can plausibly finish before the
    /// configured ceiling.
    pub fn can_complete_task(&self, tasks: usize) -> bool {
        self.time_limit(tasks) < self.config.max_running_time
    }

    /// A round timed out with nothing received, so there is no sample to
    /// learn from; only the window shrinks.
    pub fn force_expired_time_limit(&mut self) {
        self.halve();
    }

    pub fn mark_probing(&mut self) {
        if self.state == WorkerState::Active {
            self.state = WorkerState::Probing;
        }
    }

    pub fn mark_removed(&mut self) {
        self.state = WorkerState::Removed;
    }

    /// Rebinds the tracker to a fresh connection to the same worker. A
    /// removed tracker stays removed.
    pub fn migrate(&mut self, channel: ChannelId) -> bool {
        if self.state == WorkerState::Removed {
            return false;
        }
        self.channel = channel;
        self.state = WorkerState::Active;
        true
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn expected_tasks(&self) -> usize {
        self.expected_tasks
    }

    pub fn estimated_rtt(&self) -> Duration {
        seconds(self.estimated_rtt)
    }

    pub fn dev_rtt(&self) -> Option<Duration> {
        self.dev_rtt.map(seconds)
    }

    pub fn last_round(&self) -> (usize, Duration) {
        (self.last_sent, self.last_elapsed)
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            addr: self.addr,
            state: self.state,
            expected_tasks: self.expected_tasks,
            estimated_rtt: self.estimated_rtt(),
            dev_rtt: self.dev_rtt(),
        }
    }

    fn halve(&mut self) {
        self.expected_tasks = (self.expected_tasks / 2).max(1);
    }

    fn dev(&self) -> f64 {
        self.dev_rtt.unwrap_or(0.0)
    }
}

fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
