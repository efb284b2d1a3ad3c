use serde::{Deserialize, Serialize};

use crate::entity::EntityId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub item_id: EntityId,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub unit_price: f64,
}

fn default_quantity() -> u32 {
    1
}

entity_schema! {
    Order / OrderPatch {
        #[serde(default)]
        table_id: Option<EntityId>,
        #[serde(default)]
        lines: Vec<OrderLine>,
        #[serde(default)]
        status: String,
        #[serde(default)]
        total: f64,
    }
}

impl Order {
    /// Sum of line totals.
    pub fn computed_total(&self) -> f64 {
        self.lines
            .iter()
            .map(|line| line.unit_price * f64::from(line.quantity))
            .sum()
    }
}
