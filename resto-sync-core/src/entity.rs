//! Entity identity and the tagged unions the sync engine moves around.
//!
//! Every record belongs to exactly one [`EntityType`]. Records created while
//! the server has not acknowledged them carry a temporary [`EntityId`]
//! (`tmp-<uuid>`); the server later hands back a permanent id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Attachment, Branch, BranchPatch, Category, CategoryPatch, DiningTable, DiningTablePatch,
    Expense, ExpensePatch, Item, ItemPatch, Order, OrderPatch,
};

/// Prefix marking client-generated identifiers.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Name of the discriminator field in serialized records and patches.
pub const ENTITY_TYPE_TAG: &str = "entityType";

/// Logical collection a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Branch,
    Category,
    Item,
    Table,
    Order,
    Expense,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Branch,
        EntityType::Category,
        EntityType::Item,
        EntityType::Table,
        EntityType::Order,
        EntityType::Expense,
    ];

    /// Plural collection name, used for storage keys and endpoints.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Branch => "branches",
            EntityType::Category => "categories",
            EntityType::Item => "items",
            EntityType::Table => "tables",
            EntityType::Order => "orders",
            EntityType::Expense => "expenses",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Branch => "branch",
            EntityType::Category => "category",
            EntityType::Item => "item",
            EntityType::Table => "table",
            EntityType::Order => "order",
            EntityType::Expense => "expense",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    /// Accepts either the singular name or the collection name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == needle || t.collection() == needle)
            .ok_or_else(|| format!("Unknown entity type: {}", s))
    }
}

/// Record identifier, either permanent (server-assigned) or temporary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh temporary identifier.
    pub fn temporary() -> Self {
        Self(format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reads an id from a JSON string or integer.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(s) => EntityId(s),
            RawId::Number(n) => EntityId(n.to_string()),
        })
    }
}

/// A patch was applied to a record of another entity type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{patch} patch cannot be applied to a {record} record")]
pub struct EntityMismatch {
    pub record: EntityType,
    pub patch: EntityType,
}

/// A full record, tagged by entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", rename_all = "lowercase")]
pub enum EntityRecord {
    Branch(Branch),
    Category(Category),
    Item(Item),
    Table(DiningTable),
    Order(Order),
    Expense(Expense),
}

/// Partial record used by updates. Absent fields leave the record untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", rename_all = "lowercase")]
pub enum EntityPatch {
    Branch(BranchPatch),
    Category(CategoryPatch),
    Item(ItemPatch),
    Table(DiningTablePatch),
    Order(OrderPatch),
    Expense(ExpensePatch),
}

/// Inserts the entity type tag into an untagged JSON object and decodes it.
fn decode_tagged<T: serde::de::DeserializeOwned>(
    entity_type: EntityType,
    mut value: Value,
) -> Result<T, serde_json::Error> {
    if let Value::Object(map) = &mut value {
        map.insert(
            ENTITY_TYPE_TAG.to_string(),
            Value::String(entity_type.as_str().to_string()),
        );
    }
    serde_json::from_value(value)
}

/// Serializes a tagged value and strips the tag, leaving the wire fields.
fn untagged_fields<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(mut map)) => {
            map.remove(ENTITY_TYPE_TAG);
            map
        }
        _ => Map::new(),
    }
}

impl EntityRecord {
    /// Decodes a record as returned by the server, which carries no tag.
    pub fn from_remote(entity_type: EntityType, value: Value) -> Result<Self, serde_json::Error> {
        decode_tagged(entity_type, value)
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityRecord::Branch(_) => EntityType::Branch,
            EntityRecord::Category(_) => EntityType::Category,
            EntityRecord::Item(_) => EntityType::Item,
            EntityRecord::Table(_) => EntityType::Table,
            EntityRecord::Order(_) => EntityType::Order,
            EntityRecord::Expense(_) => EntityType::Expense,
        }
    }

    pub fn id(&self) -> &EntityId {
        match self {
            EntityRecord::Branch(r) => &r.id,
            EntityRecord::Category(r) => &r.id,
            EntityRecord::Item(r) => &r.id,
            EntityRecord::Table(r) => &r.id,
            EntityRecord::Order(r) => &r.id,
            EntityRecord::Expense(r) => &r.id,
        }
    }

    pub fn set_id(&mut self, id: EntityId) {
        match self {
            EntityRecord::Branch(r) => r.id = id,
            EntityRecord::Category(r) => r.id = id,
            EntityRecord::Item(r) => r.id = id,
            EntityRecord::Table(r) => r.id = id,
            EntityRecord::Order(r) => r.id = id,
            EntityRecord::Expense(r) => r.id = id,
        }
    }

    /// Shallow-overlays `patch` onto this record.
    pub fn apply(&mut self, patch: &EntityPatch) -> Result<(), EntityMismatch> {
        match (self, patch) {
            (EntityRecord::Branch(r), EntityPatch::Branch(p)) => p.overlay(r),
            (EntityRecord::Category(r), EntityPatch::Category(p)) => p.overlay(r),
            (EntityRecord::Item(r), EntityPatch::Item(p)) => p.overlay(r),
            (EntityRecord::Table(r), EntityPatch::Table(p)) => p.overlay(r),
            (EntityRecord::Order(r), EntityPatch::Order(p)) => p.overlay(r),
            (EntityRecord::Expense(r), EntityPatch::Expense(p)) => p.overlay(r),
            (record, patch) => {
                return Err(EntityMismatch {
                    record: record.entity_type(),
                    patch: patch.entity_type(),
                })
            }
        }
        Ok(())
    }

    /// Binary parts carried by the record, keyed by field name.
    pub fn attachments(&self) -> Vec<(&'static str, &Attachment)> {
        match self {
            EntityRecord::Item(item) => item.image.iter().map(|a| ("image", a)).collect(),
            _ => Vec::new(),
        }
    }

    /// Wire representation: the record's fields without the type tag.
    pub fn fields(&self) -> Map<String, Value> {
        untagged_fields(self)
    }
}

impl EntityPatch {
    /// Decodes an untagged patch object for `entity_type`.
    pub fn from_value(entity_type: EntityType, value: Value) -> Result<Self, serde_json::Error> {
        decode_tagged(entity_type, value)
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityPatch::Branch(_) => EntityType::Branch,
            EntityPatch::Category(_) => EntityType::Category,
            EntityPatch::Item(_) => EntityType::Item,
            EntityPatch::Table(_) => EntityType::Table,
            EntityPatch::Order(_) => EntityType::Order,
            EntityPatch::Expense(_) => EntityType::Expense,
        }
    }

    /// Folds a later patch into this one; fields set by `later` win.
    pub fn merge(&mut self, later: &EntityPatch) -> Result<(), EntityMismatch> {
        match (self, later) {
            (EntityPatch::Branch(p), EntityPatch::Branch(l)) => p.merge(l),
            (EntityPatch::Category(p), EntityPatch::Category(l)) => p.merge(l),
            (EntityPatch::Item(p), EntityPatch::Item(l)) => p.merge(l),
            (EntityPatch::Table(p), EntityPatch::Table(l)) => p.merge(l),
            (EntityPatch::Order(p), EntityPatch::Order(l)) => p.merge(l),
            (EntityPatch::Expense(p), EntityPatch::Expense(l)) => p.merge(l),
            (patch, later) => {
                return Err(EntityMismatch {
                    record: patch.entity_type(),
                    patch: later.entity_type(),
                })
            }
        }
        Ok(())
    }

    pub fn attachments(&self) -> Vec<(&'static str, &Attachment)> {
        match self {
            EntityPatch::Item(patch) => match &patch.image {
                Some(Some(a)) => vec![("image", a)],
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    pub fn fields(&self) -> Map<String, Value> {
        untagged_fields(self)
    }
}
