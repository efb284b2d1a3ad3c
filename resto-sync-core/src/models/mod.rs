//! Field schemas for each entity the admin client manages.
//!
//! Each record type is declared together with its patch type through
//! [`entity_schema!`], so the overlay used by local updates and the merge
//! engine is checked per entity at compile time.

use serde::{Deserialize, Deserializer};

/// Distinguishes "field absent" (`None`) from "field present", including an
/// explicit `null` for optional fields (`Some(None)`).
pub(crate) fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

pub(crate) fn default_true() -> bool {
    true
}

/// Declares a record struct and its all-optional patch struct.
macro_rules! entity_schema {
    (
        $(#[$meta:meta])*
        $record:ident / $patch:ident {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $record {
            #[serde(default)]
            pub id: crate::entity::EntityId,
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        #[doc = concat!("Partial [`", stringify!($record), "`]; unset fields are left alone.")]
        #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $patch {
            $(
                #[serde(
                    default,
                    deserialize_with = "crate::models::present",
                    skip_serializing_if = "Option::is_none"
                )]
                pub $field: Option<$ty>,
            )*
        }

        impl $patch {
            pub(crate) fn overlay(&self, record: &mut $record) {
                $(
                    if let Some(value) = &self.$field {
                        record.$field = value.clone();
                    }
                )*
            }

            pub(crate) fn merge(&mut self, later: &$patch) {
                $(
                    if later.$field.is_some() {
                        self.$field = later.$field.clone();
                    }
                )*
            }
        }
    };
}

mod attachment;
mod branch;
mod category;
mod expense;
mod item;
mod order;
mod table;

pub use attachment::Attachment;
pub use branch::{Branch, BranchPatch};
pub use category::{Category, CategoryPatch};
pub use expense::{Expense, ExpensePatch};
pub use item::{Item, ItemPatch};
pub use order::{Order, OrderLine, OrderPatch};
pub use table::{DiningTable, DiningTablePatch};
