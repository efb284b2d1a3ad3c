use chrono::NaiveDate;

use crate::entity::EntityId;

entity_schema! {
    /// An operating expense booked against a branch.
    Expense / ExpensePatch {
        #[serde(default)]
        description: String,
        #[serde(default)]
        amount: f64,
        #[serde(default)]
        category: Option<String>,
        #[serde(default)]
        branch_id: Option<EntityId>,
        #[serde(default)]
        incurred_on: Option<NaiveDate>,
    }
}
