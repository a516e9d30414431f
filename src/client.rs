//! HTTP client for the Ollama daemon API

use crate::error::{BootstrapError, BootstrapResult};
use crate::models::ModelRef;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Daemon API surface used by the bootstrap sequence
#[async_trait]
pub trait ServiceApi: Send + Sync {
    /// Daemon version; doubles as the readiness probe
    async fn version(&self) -> BootstrapResult<String>;

    /// Names of models present in the daemon's local store
    async fn list_models(&self) -> BootstrapResult<Vec<String>>;

    /// Endpoint description for logs and errors
    fn endpoint(&self) -> String;
}

/// A model as reported by `GET /api/tags`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<LocalModel>,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// One line of the `POST /api/pull` progress stream
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PullProgress {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    /// Completion percentage of the current layer, when sizes are known
    pub fn percent(&self) -> Option<u8> {
        match (self.completed, self.total) {
            (Some(done), Some(total)) if total > 0 => {
                Some(((done.min(total) * 100) / total) as u8)
            }
            _ => None,
        }
    }
}

/// Client for the daemon's HTTP API
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: Url,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl OllamaClient {
    /// Create a client; `request_timeout` bounds short API calls, not pulls
    pub fn new(mut base_url: Url, request_timeout: Duration) -> BootstrapResult<Self> {
        // Keep a path prefix (reverse proxies) when joining API paths
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;

        Ok(Self {
            base_url,
            http,
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> BootstrapResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| BootstrapError::Api(format!("invalid API path {}: {}", path, e)))
    }

    /// Turn a non-2xx response into an API error, using the daemon's message when present
    async fn check_status(response: reqwest::Response) -> BootstrapResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);

        Err(BootstrapError::Api(format!("{}: {}", status, message.trim())))
    }

    /// Whether the daemon already has `model` locally
    pub async fn has_model(&self, model: &ModelRef) -> BootstrapResult<bool> {
        let listed = self.list_models().await?;
        Ok(listed.iter().any(|name| model.matches_listed(name)))
    }

    /// Pull a model, invoking `on_progress` for every progress line
    ///
    /// Fails on an `error` line, on a non-2xx response, or when the stream
    /// ends without reporting `success`.
    pub async fn pull_with_progress<F>(
        &self,
        model: &ModelRef,
        mut on_progress: F,
    ) -> BootstrapResult<()>
    where
        F: FnMut(&PullProgress) + Send,
    {
        let url = self.url("api/pull")?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "model": model.to_string(),
                "stream": true,
            }))
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let pull_failed = |reason: String| BootstrapError::PullFailed {
            model: model.to_string(),
            reason,
        };

        let mut decoder = NdjsonDecoder::default();
        let mut stream = response.bytes_stream();
        let mut succeeded = false;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for line in decoder.push(&chunk) {
                let progress: PullProgress = serde_json::from_str(&line)
                    .map_err(|e| pull_failed(format!("malformed progress line: {}", e)))?;

                if let Some(error) = progress.error {
                    return Err(pull_failed(error));
                }

                on_progress(&progress);
                succeeded |= progress.is_success();
            }
        }

        if let Some(rest) = decoder.finish() {
            let progress: PullProgress = serde_json::from_str(&rest)
                .map_err(|e| pull_failed(format!("malformed progress line: {}", e)))?;
            if let Some(error) = progress.error {
                return Err(pull_failed(error));
            }
            on_progress(&progress);
            succeeded |= progress.is_success();
        }

        if !succeeded {
            return Err(pull_failed("stream ended without success".to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl ServiceApi for OllamaClient {
    async fn version(&self) -> BootstrapResult<String> {
        let response = self
            .http
            .get(self.url("api/version")?)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let body: VersionResponse = response.json().await?;
        Ok(body.version)
    }

    async fn list_models(&self) -> BootstrapResult<Vec<String>> {
        let response = self
            .http
            .get(self.url("api/tags")?)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn endpoint(&self) -> String {
        self.base_url.to_string()
    }
}

/// Splits a byte stream into newline-delimited JSON records
#[derive(Debug, Default)]
pub(crate) struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    /// Feed a chunk; returns every complete, non-blank line it closed
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    /// Trailing record without a final newline, if any
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_splits_across_chunks() {
        let mut decoder = NdjsonDecoder::default();

        assert!(decoder.push(b"{\"status\":\"pulling").is_empty());
        let lines = decoder.push(b" manifest\"}\n{\"status\":\"verifying\"}\n\n{\"sta");
        assert_eq!(
            lines,
            vec![
                "{\"status\":\"pulling manifest\"}".to_string(),
                "{\"status\":\"verifying\"}".to_string(),
            ]
        );

        assert!(decoder.push(b"tus\":\"success\"}").is_empty());
        assert_eq!(
            decoder.finish().as_deref(),
            Some("{\"status\":\"success\"}")
        );
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_progress_percent() {
        let progress = PullProgress {
            status: "downloading".to_string(),
            total: Some(200),
            completed: Some(50),
            ..Default::default()
        };
        assert_eq!(progress.percent(), Some(25));

        let unknown = PullProgress {
            status: "pulling manifest".to_string(),
            ..Default::default()
        };
        assert_eq!(unknown.percent(), None);

        let zero = PullProgress {
            total: Some(0),
            completed: Some(0),
            ..Default::default()
        };
        assert_eq!(zero.percent(), None);
    }

    #[test]
    fn test_progress_line_parsing() {
        let line = r#"{"status":"pulling 6a0746a1ec1a","digest":"sha256:6a07","total":4661211424,"completed":1048576}"#;
        let progress: PullProgress = serde_json::from_str(line).unwrap();
        assert_eq!(progress.total, Some(4661211424));
        assert!(!progress.is_success());

        let error: PullProgress = serde_json::from_str(r#"{"error":"pull model manifest: file does not exist"}"#).unwrap();
        assert!(error.error.is_some());
    }

    #[test]
    fn test_client_endpoint() {
        let client = OllamaClient::new(
            Url::parse("http://localhost:11434").unwrap(),
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:11434/");
        assert_eq!(
            client.url("api/version").unwrap().as_str(),
            "http://localhost:11434/api/version"
        );

        let proxied = OllamaClient::new(
            Url::parse("https://gateway.internal/ollama").unwrap(),
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(
            proxied.url("api/tags").unwrap().as_str(),
            "https://gateway.internal/ollama/api/tags"
        );
    }
}
