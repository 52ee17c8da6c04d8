//! HTTP client for the cluster provisioner.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{SandboxConfig, DEFAULT_TIMEOUT_SECS};
use crate::error::{SandboxError, SandboxResult};
use crate::identity::SandboxIdentity;
use crate::protocol::{
    AcquireRequest, CleanupResponse, ErrorBody, ExecuteRequest, ExecuteResponse, HealthResponse, Lease,
    ListRequest, ListResponse, ReadFileRequest, ReadFileResponse, ReleaseRequest, ReleaseResponse,
    ReplaceRequest, ReplaceResponse, WriteFileRequest, WriteFileResponse,
};

/// Deadline for calls that may have to wait for a pod to start.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Longest remote error message kept.
const MAX_ERROR_LEN: usize = 500;

/// Talks to a provisioner over HTTP, optionally with a bearer token.
#[derive(Debug, Clone)]
pub struct ProvisionerClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ProvisionerClient {
    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    /// Client for the provisioner named in `config`.
    pub fn from_config(http: reqwest::Client, config: &SandboxConfig) -> SandboxResult<Self> {
        let url = config
            .provisioner_url
            .as_deref()
            .ok_or_else(|| SandboxError::invalid_config("cluster mode requires a provisioner URL"))?;
        Ok(Self::with_client(http, url, config.provisioner_api_key.clone()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> SandboxResult<HealthResponse> {
        let url = format!("{}/healthz", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport_error("GET /healthz", e))?;
        handle_response(response).await
    }

    pub async fn acquire(&self, identity: &SandboxIdentity) -> SandboxResult<Lease> {
        let request = AcquireRequest {
            identity: identity.clone(),
        };
        self.post("/v1/sandbox/acquire", &request, REQUEST_TIMEOUT).await
    }

    pub async fn release(&self, request: &ReleaseRequest) -> SandboxResult<ReleaseResponse> {
        self.post("/v1/sandbox/release", request, REQUEST_TIMEOUT).await
    }

    /// The HTTP deadline covers pod startup plus the command's own timeout.
    pub async fn execute(&self, request: &ExecuteRequest) -> SandboxResult<ExecuteResponse> {
        let command_timeout = Duration::from_secs(request.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS));
        self.post("/v1/sandbox/execute", request, REQUEST_TIMEOUT + command_timeout)
            .await
    }

    pub async fn list(&self, request: &ListRequest) -> SandboxResult<ListResponse> {
        self.post("/v1/sandbox/ls", request, REQUEST_TIMEOUT).await
    }

    pub async fn read_file(&self, request: &ReadFileRequest) -> SandboxResult<ReadFileResponse> {
        self.post("/v1/sandbox/read_file", request, REQUEST_TIMEOUT).await
    }

    pub async fn write_file(&self, request: &WriteFileRequest) -> SandboxResult<WriteFileResponse> {
        self.post("/v1/sandbox/write_file", request, REQUEST_TIMEOUT).await
    }

    pub async fn replace(&self, request: &ReplaceRequest) -> SandboxResult<ReplaceResponse> {
        self.post("/v1/sandbox/replace", request, REQUEST_TIMEOUT).await
    }

    pub async fn cleanup_idle(&self) -> SandboxResult<CleanupResponse> {
        self.post("/v1/sandbox/cleanup_idle", &serde_json::json!({}), REQUEST_TIMEOUT)
            .await
    }

    /// POST request helper
    async fn post<T: DeserializeOwned, R: Serialize>(
        &self,
        path: &str,
        body: &R,
        timeout: Duration,
    ) -> SandboxResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.post(&url).json(body).timeout(timeout);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        debug!(url = %url, "provisioner request");
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&format!("POST {}", path), e))?;
        handle_response(response).await
    }
}

fn transport_error(operation: &str, err: reqwest::Error) -> SandboxError {
    if err.is_timeout() {
        return SandboxError::Timeout {
            operation: operation.to_string(),
            seconds: REQUEST_TIMEOUT.as_secs(),
        };
    }
    SandboxError::unavailable(format!("{}: {}", operation, err))
}

async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> SandboxResult<T> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SandboxError::Unauthorized);
    }
    let text = response
        .text()
        .await
        .map_err(|e| SandboxError::unavailable(format!("reading provisioner response: {}", e)))?;

    if !status.is_success() {
        if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
            return Err(SandboxError::from_body(status.as_u16(), body));
        }
        return Err(SandboxError::Remote {
            status: status.as_u16(),
            message: remote_message(status, &text),
        });
    }

    let value: Value = serde_json::from_str(&text)
        .map_err(|e| SandboxError::invalid_response(format!("provisioner returned invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(SandboxError::invalid_response("provisioner response is not a JSON object"));
    }
    serde_json::from_value(value).map_err(|e| SandboxError::invalid_response(e.to_string()))
}

/// The remote `error`/`detail` field when present, else the raw body, else
/// the status reason.
fn remote_message(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        ["error", "detail"]
            .iter()
            .find_map(|key| v.get(*key).and_then(Value::as_str).map(str::to_string))
    });
    let message = match from_json {
        Some(message) => message,
        None if !body.trim().is_empty() => body.trim().to_string(),
        None => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };
    message.chars().take(MAX_ERROR_LEN).collect()
}
