// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod channel;
pub mod config;
pub mod digest;
pub mod directory;
pub mod engine;
pub mod manager;
pub mod poller;
pub mod store;
pub mod sync;

// ---- Re-exports for stable public API ----
pub use crate::channel::{ChannelRecord, PollOutcome, SourceType};
pub use crate::config::{ConfigHandle, SchedulerConfig};
pub use crate::digest::{Cadence, Digest, DigestScheduler};
pub use crate::engine::{PollEngine, PollMode};
pub use crate::manager::{Orchestrator, OrchestratorError};
