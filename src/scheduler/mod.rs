pub mod job;
pub mod queue;

pub use job::{JobHandle, JobSpec, JobState, SessionId};
pub use queue::{JobQueue, Settled};
