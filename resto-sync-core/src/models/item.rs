use super::Attachment;
use crate::entity::EntityId;

entity_schema! {
    /// A menu item.
    ///
    /// `image` holds a locally picked photo that has not been uploaded yet;
    /// once the server has it, it is referenced through `image_url`.
    Item / ItemPatch {
        #[serde(default)]
        name: String,
        #[serde(default)]
        category_id: Option<EntityId>,
        #[serde(default)]
        price: f64,
        #[serde(default)]
        description: Option<String>,
        #[serde(default = "crate::models::default_true")]
        available: bool,
        #[serde(default)]
        image_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<Attachment>,
    }
}
