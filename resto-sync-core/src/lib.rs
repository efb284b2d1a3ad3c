//! Resto Sync Core Library
//!
//! Offline-first data layer for the restaurant admin client: a local entity
//! cache, a durable log of pending mutations, and the engine that merges
//! server snapshots with local edits and replays those edits once the
//! server is reachable.

pub mod cache;
pub mod connectivity;
pub mod engine;
pub mod entity;
pub mod error;
pub mod lock;
pub mod merge;
pub mod models;
pub mod oplog;
pub mod remote;
pub mod storage;
pub mod sync;

pub use cache::{CacheLoad, EntityCache};
pub use connectivity::{check_server, ConnectivityMonitor, Subscription};
pub use engine::{EngineSettings, SyncEngine, SyncStatus};
pub use entity::{EntityId, EntityMismatch, EntityPatch, EntityRecord, EntityType};
pub use error::{Result, SyncError};
pub use lock::{LockGuard, LockStatus, SyncLock, DEFAULT_LOCK_TTL};
pub use merge::{FetchOutcome, FetchSource, MergeEngine};
pub use models::Attachment;
pub use oplog::{Mutation, OperationKind, OperationLog, PendingOperation};
pub use remote::{Endpoints, HttpRemote, Remote, RemoteError, Submission};
pub use storage::{FileStore, KeyLock, KeyValueStore, MemoryStore, StorageError};
pub use sync::{DrainOutcome, SyncOrchestrator};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
