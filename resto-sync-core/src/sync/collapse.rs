//! Collapses the operation log into one server call per record.

use std::collections::HashMap;

use uuid::Uuid;

use crate::entity::{EntityId, EntityPatch, EntityRecord, EntityType};
use crate::oplog::{Mutation, PendingOperation};

/// What a collapsed operation sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayAction {
    Create { record: EntityRecord },
    Update { id: EntityId, patch: EntityPatch },
    Delete { id: EntityId },
    /// Created and deleted locally; the server never needs to hear of it.
    Discard,
}

/// The net effect of every pending operation on one record.
#[derive(Debug, Clone, PartialEq)]
pub struct CollapsedOperation {
    pub group_key: String,
    pub entity_type: EntityType,
    pub action: ReplayAction,
    pub endpoint: String,
    /// Every log entry this operation stands for. All of them are removed
    /// together once it succeeds.
    pub sources: Vec<Uuid>,
    /// `enqueued_at` of the group's first operation; replay order.
    pub order: u64,
}

/// Collapses pending operations per group key.
///
/// - create followed by updates: one create with the updates folded in
/// - create followed by a delete: discarded
/// - updates only: one update carrying the merged patch
/// - any delete without a create: the latest delete
///
/// The result is ordered by each group's first `enqueued_at`.
pub fn collapse(mut operations: Vec<PendingOperation>) -> Vec<CollapsedOperation> {
    operations.sort_by_key(|op| op.enqueued_at);

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<PendingOperation>> = Vec::new();
    for op in operations {
        match index.get(&op.group_key) {
            Some(&i) => groups[i].push(op),
            None => {
                index.insert(op.group_key.clone(), groups.len());
                groups.push(vec![op]);
            }
        }
    }

    let mut collapsed: Vec<CollapsedOperation> =
        groups.into_iter().filter_map(collapse_group).collect();
    collapsed.sort_by_key(|op| op.order);
    collapsed
}

/// Collapses the operations of a single group, already in enqueue order.
fn collapse_group(group: Vec<PendingOperation>) -> Option<CollapsedOperation> {
    let first = group.first()?;
    let group_key = first.group_key.clone();
    let entity_type = first.entity_type;
    let order = first.enqueued_at;
    let sources: Vec<Uuid> = group.iter().map(|op| op.operation_id).collect();

    let create = group
        .iter()
        .find(|op| matches!(op.mutation, Mutation::Create { .. }));
    let last_delete = group
        .iter()
        .rev()
        .find(|op| matches!(op.mutation, Mutation::Delete { .. }));

    let (action, endpoint) = match (create, last_delete) {
        (Some(_), Some(delete)) => (ReplayAction::Discard, delete.target_endpoint.clone()),
        (None, Some(delete)) => (
            ReplayAction::Delete {
                id: delete.record_id().clone(),
            },
            delete.target_endpoint.clone(),
        ),
        (Some(create), None) => {
            let Mutation::Create { record } = &create.mutation else {
                return None;
            };
            let mut record = record.clone();
            for op in &group {
                if let Mutation::Update { patch, .. } = &op.mutation {
                    if let Err(e) = record.apply(patch) {
                        tracing::warn!(operation_id = %op.operation_id, error = %e, "Dropping mismatched update while collapsing");
                    }
                }
            }
            (ReplayAction::Create { record }, create.target_endpoint.clone())
        }
        (None, None) => {
            let mut updates = group.iter().filter_map(|op| match &op.mutation {
                Mutation::Update { id, patch } => Some((op, id, patch)),
                _ => None,
            });
            let (first_op, id, patch) = updates.next()?;
            let mut merged = patch.clone();
            let mut endpoint = first_op.target_endpoint.clone();
            for (op, _, later) in updates {
                if let Err(e) = merged.merge(later) {
                    tracing::warn!(operation_id = %op.operation_id, error = %e, "Dropping mismatched update while collapsing");
                    continue;
                }
                endpoint = op.target_endpoint.clone();
            }
            (
                ReplayAction::Update {
                    id: id.clone(),
                    patch: merged,
                },
                endpoint,
            )
        }
    };

    Some(CollapsedOperation {
        group_key,
        entity_type,
        action,
        endpoint,
        sources,
        order,
    })
}
