//! Boundary to the remote admin backend.
//!
//! Every mutation is replayed as `POST <endpoint>` and answered with an
//! envelope `{ status: "success" | "error", data?, message? }`. Listing a
//! collection is `POST <view endpoint>` answered with `{ data: { data: [...] } }`.

mod http;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::entity::EntityType;
use crate::models::Attachment;
use crate::oplog::OperationKind;

pub use http::HttpRemote;

/// Why a remote call did not succeed. Every variant is retryable later.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// No usable response: connection refused, timeout, truncated body.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered and said no.
    #[error("Rejected by server: {message}")]
    Rejected { message: String },

    /// The server answered with something that is not the expected shape.
    #[error("Unexpected response: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }
}

/// A file part of a multipart submission.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Request body for one replayed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Json(Value),
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<FilePart>,
    },
}

impl Submission {
    /// JSON unless binary content is present, in which case every other
    /// field becomes a text part and every attachment a file part.
    pub fn from_parts(mut fields: Map<String, Value>, attachments: Vec<(&str, &Attachment)>) -> Self {
        if attachments.is_empty() {
            return Submission::Json(Value::Object(fields));
        }

        let files = attachments
            .into_iter()
            .map(|(field, attachment)| {
                fields.remove(field);
                FilePart {
                    field: field.to_string(),
                    file_name: attachment.file_name.clone(),
                    content_type: attachment.content_type.clone(),
                    data: attachment.data.clone(),
                }
            })
            .collect();

        // Form data has no null: a cleared field goes out as an empty part.
        let fields = fields
            .into_iter()
            .map(|(name, value)| {
                let text = match value {
                    Value::Null => String::new(),
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (name, text)
            })
            .collect();

        Submission::Multipart { fields, files }
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self, Submission::Multipart { .. })
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Unwraps a mutation response envelope into its `data`.
pub fn parse_envelope(body: Value) -> Result<Value, RemoteError> {
    let envelope: Envelope = serde_json::from_value(body)
        .map_err(|e| RemoteError::Protocol(format!("invalid envelope: {}", e)))?;
    match envelope.status.as_str() {
        "success" => Ok(envelope.data.unwrap_or(Value::Null)),
        "error" => Err(RemoteError::Rejected {
            message: envelope
                .message
                .unwrap_or_else(|| "no message given".to_string()),
        }),
        other => Err(RemoteError::Protocol(format!("unknown status '{}'", other))),
    }
}

/// Extracts the record list from a view response.
pub fn parse_listing(body: Value) -> Result<Vec<Value>, RemoteError> {
    if body.get("status").and_then(Value::as_str) == Some("error") {
        return Err(RemoteError::Rejected {
            message: body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message given")
                .to_string(),
        });
    }
    match body.pointer("/data/data") {
        Some(Value::Array(records)) => Ok(records.clone()),
        _ => Err(RemoteError::Protocol(
            "view response missing data.data list".to_string(),
        )),
    }
}

/// Remote backend the engine replays against.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Replays one operation; returns the envelope's `data` on success.
    async fn submit(&self, endpoint: &str, submission: Submission) -> Result<Value, RemoteError>;

    /// Fetches the authoritative list behind a view endpoint.
    async fn fetch_all(&self, endpoint: &str) -> Result<Vec<Value>, RemoteError>;
}

/// Endpoint naming: `<prefix><collection>/<action>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    prefix: String,
}

impl Endpoints {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn for_kind(&self, entity_type: EntityType, kind: OperationKind) -> String {
        self.path(entity_type, &kind.to_string())
    }

    pub fn view(&self, entity_type: EntityType) -> String {
        self.path(entity_type, "view")
    }

    fn path(&self, entity_type: EntityType, action: &str) -> String {
        format!("{}{}/{}", self.prefix, entity_type.collection(), action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_envelope_success() {
        let data = parse_envelope(json!({"status": "success", "data": {"id": 42}})).unwrap();
        assert_eq!(data["id"], 42);
    }

    #[test]
    fn test_parse_envelope_error() {
        let err = parse_envelope(json!({"status": "error", "message": "duplicate name"}))
            .unwrap_err();
        assert_eq!(
            err,
            RemoteError::Rejected {
                message: "duplicate name".to_string()
            }
        );
        assert!(!err.is_transport());
    }

    #[test]
    fn test_parse_envelope_malformed() {
        assert!(matches!(
            parse_envelope(json!({"ok": true})),
            Err(RemoteError::Protocol(_))
        ));
        assert!(matches!(
            parse_envelope(json!({"status": "pending"})),
            Err(RemoteError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_listing() {
        let records = parse_listing(json!({"data": {"data": [{"id": 1}, {"id": 2}]}})).unwrap();
        assert_eq!(records.len(), 2);
        assert!(parse_listing(json!({"data": []})).is_err());
    }

    #[test]
    fn test_endpoints() {
        let endpoints = Endpoints::new("api/");
        assert_eq!(
            endpoints.for_kind(EntityType::Item, OperationKind::Create),
            "api/items/create"
        );
        assert_eq!(endpoints.view(EntityType::Category), "api/categories/view");
        assert_eq!(
            Endpoints::default().for_kind(EntityType::Table, OperationKind::Delete),
            "tables/delete"
        );
    }

    #[test]
    fn test_submission_without_attachments_is_json() {
        let mut fields = Map::new();
        fields.insert("name".to_string(), json!("Tea"));
        let submission = Submission::from_parts(fields, Vec::new());
        assert_eq!(submission, Submission::Json(json!({"name": "Tea"})));
    }

    #[test]
    fn test_submission_with_attachment_is_multipart() {
        let attachment = Attachment::new("tea.png", "image/png", vec![1, 2]);
        let mut fields = Map::new();
        fields.insert("name".to_string(), json!("Tea"));
        fields.insert("price".to_string(), json!(2.5));
        fields.insert("description".to_string(), Value::Null);
        fields.insert("image".to_string(), json!({"fileName": "tea.png"}));

        let submission = Submission::from_parts(fields, vec![("image", &attachment)]);

        match submission {
            Submission::Multipart { fields, files } => {
                assert!(fields.contains(&("name".to_string(), "Tea".to_string())));
                assert!(fields.contains(&("price".to_string(), "2.5".to_string())));
                assert!(fields.contains(&("description".to_string(), String::new())));
                assert!(!fields.iter().any(|(name, _)| name == "image"));
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].field, "image");
                assert_eq!(files[0].data, vec![1, 2]);
            }
            other => panic!("expected multipart, got {:?}", other),
        }
    }

    #[test]
    fn test_patch_clearing_a_field_with_new_image_keeps_the_clear() {
        let patch = crate::entity::EntityPatch::from_value(
            crate::entity::EntityType::Item,
            json!({
                "description": null,
                "image": {"fileName": "tea.png", "contentType": "image/png", "data": "AQI="}
            }),
        )
        .unwrap();

        match Submission::from_parts(patch.fields(), patch.attachments()) {
            Submission::Multipart { fields, files } => {
                assert_eq!(fields, vec![("description".to_string(), String::new())]);
                assert_eq!(files[0].data, vec![1, 2]);
            }
            other => panic!("expected multipart, got {:?}", other),
        }
    }
}
