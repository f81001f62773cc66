//! Client for the Ollama REST API.
//!
//! Wraps `POST /api/chat` and `GET /api/tags` with a bounded retry policy:
//! connection and timeout failures back off exponentially (2^attempt
//! seconds) up to `max_retries` attempts; model-not-found and other API
//! errors surface immediately. The loop engine depends only on the
//! [`ModelClient`] trait so tests can script replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to Ollama at {0}. Is it running?")]
    Connection(String),
    #[error("request to Ollama timed out after {0} seconds")]
    Timeout(u64),
    #[error("model '{0}' not found. Run: ollama pull {0}")]
    ModelNotFound(String),
    #[error("Ollama API error: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// "system", "user", or "assistant".
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Response from a chat exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub done: bool,
    pub total_duration: Option<u64>,
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
}

/// The model-client seam the engine and health check depend on.
pub trait ModelClient {
    fn chat(
        &self,
        messages: &[Message],
        model: &str,
    ) -> impl Future<Output = Result<ChatResponse>> + Send;

    fn list_models(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Client for Ollama's REST API.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    timeout: Duration,
    max_retries: u32,
    http: reqwest::Client,
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, DEFAULT_TIMEOUT, DEFAULT_RETRIES)
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt)
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration, max_retries: u32) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            max_retries: max_retries.max(1),
            http: reqwest::Client::new(),
        }
    }

    /// Client with the default timeout and retry policy.
    pub fn with_base_url(base_url: &str) -> Self {
        Self::new(base_url, DEFAULT_TIMEOUT, DEFAULT_RETRIES)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request(
        &self,
        endpoint: &str,
        body: Option<&Value>,
        model: Option<&str>,
    ) -> Result<Value> {
        let url = format!("{}{endpoint}", self.base_url);

        for attempt in 0..self.max_retries {
            let builder = match body {
                Some(json) => self.http.post(&url).json(json),
                None => self.http.get(&url),
            };

            let outcome = builder.timeout(self.timeout).send().await;

            let retryable = match outcome {
                Ok(response) => {
                    if response.status() == reqwest::StatusCode::NOT_FOUND {
                        return Err(ClientError::ModelNotFound(
                            model.unwrap_or("unknown").to_string(),
                        ));
                    }
                    if !response.status().is_success() {
                        return Err(ClientError::Api(format!(
                            "{endpoint} returned {}",
                            response.status()
                        )));
                    }
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|e| ClientError::Api(e.to_string()));
                }
                Err(e) if e.is_timeout() => ClientError::Timeout(self.timeout.as_secs()),
                Err(e) if e.is_connect() => ClientError::Connection(self.base_url.clone()),
                Err(e) => return Err(ClientError::Api(e.to_string())),
            };

            if attempt + 1 < self.max_retries {
                let delay = backoff_delay(attempt);
                warn!(
                    endpoint,
                    attempt = attempt + 1,
                    max_retries = self.max_retries,
                    delay_sec = delay.as_secs(),
                    error = %retryable,
                    "request failed, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            } else {
                return Err(retryable);
            }
        }

        // max_retries is clamped to at least 1 so the loop always returns.
        Err(ClientError::Api("request failed without attempts".to_string()))
    }

    /// True iff Ollama is reachable.
    pub async fn is_healthy(&self) -> bool {
        self.list_models().await.is_ok()
    }
}

impl ModelClient for OllamaClient {
    /// Have a multi-turn conversation with the model via `POST /api/chat`.
    async fn chat(&self, messages: &[Message], model: &str) -> Result<ChatResponse> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });

        debug!(model, message_count = messages.len(), "sending chat request");
        let response = self.request("/api/chat", Some(&body), Some(model)).await?;

        let content = response
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(ChatResponse {
            content,
            model: response
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(model)
                .to_string(),
            done: response.get("done").and_then(Value::as_bool).unwrap_or(true),
            total_duration: response.get("total_duration").and_then(Value::as_u64),
            prompt_eval_count: response.get("prompt_eval_count").and_then(Value::as_u64),
            eval_count: response.get("eval_count").and_then(Value::as_u64),
        })
    }

    /// List installed model names via `GET /api/tags`.
    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self.request("/api/tags", None, None).await?;
        let models = response
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering every connection with a fixed response.
    async fn serve_fixed(response: &'static str, hits: Arc<AtomicU32>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn model_not_found_surfaces_without_retry() {
        let hits = Arc::new(AtomicU32::new(0));
        let url = serve_fixed(
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            Arc::clone(&hits),
        )
        .await;

        let client = OllamaClient::new(&url, Duration::from_secs(5), 3);
        let err = client
            .chat(&[Message::new("user", "hi")], "missing-model")
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::ModelNotFound(ref m) if m == "missing-model"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chat_parses_message_content() {
        let hits = Arc::new(AtomicU32::new(0));
        let body = r#"{"model":"llama3.2","message":{"role":"assistant","content":"hello"},"done":true,"eval_count":7}"#;
        let url = serve_fixed(
            // Static response; length matches the JSON body above.
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 96\r\nconnection: close\r\n\r\n{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"hello\"},\"done\":true,\"eval_count\":7}",
            Arc::clone(&hits),
        )
        .await;
        assert_eq!(body.len(), 96);

        let client = OllamaClient::new(&url, Duration::from_secs(5), 1);
        let response = client
            .chat(&[Message::new("user", "hi")], "llama3.2")
            .await
            .unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.eval_count, Some(7));
        assert!(response.done);
    }

    #[tokio::test]
    async fn connection_refused_maps_to_connection_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = OllamaClient::new(&format!("http://{addr}"), Duration::from_secs(2), 1);
        let err = client.list_models().await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));
    }

    #[tokio::test]
    async fn list_models_extracts_names() {
        let hits = Arc::new(AtomicU32::new(0));
        let body = r#"{"models":[{"name":"llama3.2:latest"},{"name":"mistral"}]}"#;
        let url = serve_fixed(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 58\r\nconnection: close\r\n\r\n{\"models\":[{\"name\":\"llama3.2:latest\"},{\"name\":\"mistral\"}]}",
            Arc::clone(&hits),
        )
        .await;
        assert_eq!(body.len(), 58);

        let client = OllamaClient::new(&url, Duration::from_secs(5), 1);
        let models = client.list_models().await.unwrap();
        assert_eq!(models, vec!["llama3.2:latest", "mistral"]);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn base_url_is_normalized() {
        let client = OllamaClient::with_base_url("http://localhost:11434/");
        assert_eq!(client.base_url(), "http://localhost:11434");
    }
}
