//! Replay of the operation log against the server.
//!
//! A drain runs in three steps:
//! 1. take the persisted sync lock, so only one drain runs at a time
//! 2. collapse the pending operations per record ([`collapse`])
//! 3. replay each collapsed operation, removing its sources on success
//!
//! Failures leave operations queued for the next drain.

mod collapse;
mod orchestrator;

pub use collapse::{collapse, CollapsedOperation, ReplayAction};
pub use orchestrator::{DrainOutcome, SyncOrchestrator};
