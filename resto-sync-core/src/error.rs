//! Engine error types.

use thiserror::Error;

use crate::entity::{EntityId, EntityMismatch, EntityType};
use crate::storage::StorageError;

/// Errors surfaced by engine operations.
///
/// Remote failures are deliberately absent: they leave operations queued and
/// are reported through outcomes, never as errors.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    EntityMismatch(#[from] EntityMismatch),

    #[error("{entity_type} not found: {id}")]
    NotFound {
        entity_type: EntityType,
        id: EntityId,
    },
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
