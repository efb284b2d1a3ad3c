entity_schema! {
    /// A restaurant location.
    Branch / BranchPatch {
        #[serde(default)]
        name: String,
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        phone: Option<String>,
        #[serde(default = "crate::models::default_true")]
        active: bool,
    }
}
