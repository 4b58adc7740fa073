//! Builder-style configuration for the dispatchers.
//!
//! Every field has a default, so `XConfig::builder().build()` (or
//! `XConfig::default()`) is always valid.

use std::{num::NonZeroUsize, thread, time::Duration};

use typed_builder::TypedBuilder;

/// Tuning for the per-worker admission window.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct TrackerConfig {
    /// Batches whose expected completion time reaches this ceiling are
    /// refused and split.
    #[builder(default = Duration::from_secs(60 * 60))]
    pub max_running_time: Duration,
    /// Multiplier applied to the RTT deviation when deriving the read
    /// deadline of the next round. Batch deadlines use the deviation
    /// unscaled.
    #[builder(default = 4.0)]
    pub timeout_deviation_factor: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration of the local thread-pool dispatcher.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct PoolConfig {
    /// Maximum number of tasks executing at once.
    #[builder(default = available_parallelism())]
    pub workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration of the network dispatcher.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct NetworkConfig {
    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,
    /// How long a worker may take to acknowledge a model upload.
    #[builder(default = Duration::from_secs(30))]
    pub init_timeout: Duration,
    /// Read deadline of the health check sent to a worker after a failed
    /// round.
    #[builder(default = Duration::from_secs(5))]
    pub probe_timeout: Duration,
    #[builder(default)]
    pub tracker: TrackerConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}
