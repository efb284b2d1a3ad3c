//! reqwest-backed [`Remote`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;

use super::{parse_envelope, parse_listing, Remote, RemoteError, Submission};

/// HTTP client for the admin backend.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpRemote {
    /// Creates a client whose requests time out after `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: None,
            client,
        })
    }

    /// Sends `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolves an endpoint against the base URL. Absolute URLs pass through.
    pub fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    fn post(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(self.url_for(endpoint));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Reads the JSON body. Non-2xx statuses become rejections, using the
    /// envelope's message when the server sent one.
    async fn read_body(response: reqwest::Response) -> Result<Value, RemoteError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let parsed = serde_json::from_str::<Value>(&body);
        if !status.is_success() {
            let message = parsed
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(RemoteError::Rejected { message });
        }

        parsed.map_err(|e| RemoteError::Protocol(format!("invalid JSON body: {}", e)))
    }

    fn multipart_form(fields: Vec<(String, String)>, files: Vec<super::FilePart>) -> Form {
        let mut form = Form::new();
        for (name, value) in fields {
            form = form.text(name, value);
        }
        for file in files {
            let part = Part::bytes(file.data.clone())
                .file_name(file.file_name.clone())
                .mime_str(&file.content_type)
                .unwrap_or_else(|e| {
                    tracing::warn!(
                        content_type = %file.content_type,
                        error = %e,
                        "Invalid content type, sending attachment untyped"
                    );
                    Part::bytes(file.data).file_name(file.file_name)
                });
            form = form.part(file.field, part);
        }
        form
    }
}

#[async_trait]
impl Remote for HttpRemote {
    async fn submit(&self, endpoint: &str, submission: Submission) -> Result<Value, RemoteError> {
        let request = match submission {
            Submission::Json(body) => self.post(endpoint).json(&body),
            Submission::Multipart { fields, files } => {
                self.post(endpoint).multipart(Self::multipart_form(fields, files))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        parse_envelope(Self::read_body(response).await?)
    }

    async fn fetch_all(&self, endpoint: &str) -> Result<Vec<Value>, RemoteError> {
        let response = self
            .post(endpoint)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        parse_listing(Self::read_body(response).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(base: &str) -> HttpRemote {
        HttpRemote::new(base, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_url_for_joins_slashes() {
        assert_eq!(
            remote("http://localhost:3000/").url_for("/items/create"),
            "http://localhost:3000/items/create"
        );
        assert_eq!(
            remote("http://localhost:3000").url_for("items/view"),
            "http://localhost:3000/items/view"
        );
    }

    #[test]
    fn test_url_for_absolute_endpoint() {
        assert_eq!(
            remote("http://localhost:3000").url_for("https://cdn.example.com/upload"),
            "https://cdn.example.com/upload"
        );
    }

    #[tokio::test]
    async fn test_submit_unreachable_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = remote(&format!("http://{}", addr))
            .submit("items/create", Submission::Json(serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
