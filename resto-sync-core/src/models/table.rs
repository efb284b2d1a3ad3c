use crate::entity::EntityId;

entity_schema! {
    /// A dining table. Named `DiningTable` to stay clear of `EntityType::Table`.
    DiningTable / DiningTablePatch {
        #[serde(default)]
        label: String,
        #[serde(default)]
        seats: u32,
        #[serde(default)]
        branch_id: Option<EntityId>,
        #[serde(default)]
        status: Option<String>,
    }
}
