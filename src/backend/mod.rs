//! Analysis backend client
//!
//! Thin typed wrapper over the backend's HTTP API. Every request carries
//! the caller's identity in a `user-id` header. JSON responses may be
//! wrapped in a `{success, message, data}` envelope; failures carry a
//! FastAPI-style `{"detail": ...}` body.

pub mod sessions;
pub mod uploads;

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;
use thiserror::Error;

use crate::config::{Config, Endpoints, UploadLimits};
use crate::engine::{ChatRequest, ChatTransport, ChunkStream};

pub use sessions::{FeatureType, NewSession};
pub use uploads::{SourceKind, UploadedSource, ValidationError};

const USER_HEADER: &str = "user-id";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("HTTP {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("File error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
    user_id: String,
    endpoints: Endpoints,
    limits: UploadLimits,
    request_timeout: Duration,
    list_limit: u32,
}

impl BackendClient {
    pub fn new(config: &Config) -> Result<Self, BackendError> {
        let http = &config.client.http;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            user_id: config.user_id.clone(),
            endpoints: config.client.endpoints.clone(),
            limits: config.client.limits.clone(),
            request_timeout: Duration::from_secs(http.request_timeout_secs),
            list_limit: http.list_limit,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Request without an overall timeout; used for streamed bodies
    fn raw_request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header(USER_HEADER, &self.user_id)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.raw_request(method, path).timeout(self.request_timeout)
    }

    /// Send a request and return the payload with any envelope removed
    async fn call(&self, builder: RequestBuilder) -> Result<Value, BackendError> {
        Ok(unwrap_envelope(self.call_raw(builder).await?))
    }

    /// Send a request and return the parsed JSON body as-is
    async fn call_raw(&self, builder: RequestBuilder) -> Result<Value, BackendError> {
        let response = ensure_success(builder.send().await?).await?;
        let body = response.text().await?;
        let value: Value = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).map_err(|e| {
                BackendError::InvalidResponse(format!("Failed to parse response: {} - Body: {}", e, body))
            })?
        };
        Ok(value)
    }
}

#[async_trait]
impl ChatTransport for BackendClient {
    async fn open(&self, request: &ChatRequest) -> Result<ChunkStream, BackendError> {
        tracing::debug!(session_id = %request.session_id, "opening chat stream");

        let response = self
            .raw_request(Method::POST, &self.endpoints.chat_message)
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| BackendError::Stream(e.to_string()))
            })
            .boxed())
    }
}

/// Turn a non-success response into `BackendError::Status`
async fn ensure_success(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        detail: error_detail(&body),
    })
}

/// Extract the human-readable part of an error body
fn error_detail(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => match map.get("detail").or_else(|| map.get("message")) {
            Some(Value::String(detail)) => detail.clone(),
            Some(other) => other.to_string(),
            None => body.to_string(),
        },
        _ => body.trim().to_string(),
    }
}

/// `{success, data, ...}` → `data`; anything else is returned as-is
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Render a JSON id (string or number) as an opaque string
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-process stand-in for the backend

    use std::net::SocketAddr;

    use axum::Router;

    use super::BackendClient;
    use crate::config::Config;

    pub const TEST_USER: &str = "user_2abc";

    /// Serve `router` on an ephemeral port and return a client for it
    pub async fn spawn(router: Router) -> BackendClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        BackendClient::new(&Config::new(format!("http://{}/", addr), TEST_USER)).unwrap()
    }
}
