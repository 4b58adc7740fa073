pub mod channel;
pub mod digest;
pub mod error;
#[cfg(feature = "master")]
pub mod master;
pub mod model;
pub mod tracker;
pub mod wire;
#[cfg(feature = "worker")]
pub mod worker;

/// Port a worker listens on when none is given.
pub const DEFAULT_WORKER_PORT: u16 = 4711;
