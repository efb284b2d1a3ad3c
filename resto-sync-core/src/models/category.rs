use crate::entity::EntityId;

entity_schema! {
    /// Menu category, optionally scoped to a branch.
    Category / CategoryPatch {
        #[serde(default)]
        name: String,
        #[serde(default)]
        branch_id: Option<EntityId>,
        #[serde(default)]
        position: Option<i32>,
    }
}
