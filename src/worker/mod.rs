//! Local execution of activated jobs.
//!
//! - [`JobExecutor`]: runs one job and reports wait and execution time
//! - [`heartbeat`]: periodic ticks and the [`MetricsTracker`] whose
//!   snapshots are published to the cluster on every tick

pub mod executor;
pub mod heartbeat;

pub use executor::{ExecutionResult, JobExecutor};
pub use heartbeat::{HeartbeatSender, MetricsTracker};
