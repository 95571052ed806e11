//! Extensions API client.
//!
//! Covers the calls an external extension makes against the Lambda runtime
//! API: the one-time registration handshake, the blocking `/event/next`
//! long-poll and the best-effort error reports. The [`ExtensionsApi`] trait
//! is the seam the [`LifecycleManager`](crate::manager::LifecycleManager)
//! is generic over, so tests can script the host side.

use crate::error::{ExtensionError, Result};
use crate::event::{EventType, LifecycleEvent};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const API_VERSION_PATH: &str = "2020-01-01/extension";
const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";
const FUNCTION_NAME_HEADER: &str = "Lambda-Extension-Function-Name";
const FUNCTION_VERSION_HEADER: &str = "Lambda-Extension-Function-Version";
const ERROR_TYPE_HEADER: &str = "Lambda-Extension-Function-Error-Type";

/// Default timeout for the short, non-polling API calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Opaque identifier issued by the host at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtensionId(String);

impl ExtensionId {
    /// Wraps a raw identifier value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as sent in the `Lambda-Extension-Identifier` header.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Identifier to present on every subsequent call.
    pub id: ExtensionId,
    /// Name of the function this environment hosts, if the host reported it.
    pub function_name: Option<String>,
    /// Version of that function, if the host reported it.
    pub function_version: Option<String>,
}

impl Registration {
    /// Creates a registration carrying only an identifier.
    pub fn new(id: ExtensionId) -> Self {
        Self {
            id,
            function_name: None,
            function_version: None,
        }
    }
}

/// Failures talking to the Extensions API.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request could not be completed.
    #[error("request to extensions API failed")]
    Transport(#[source] reqwest::Error),

    /// The host answered with a non-success status.
    #[error("extensions API returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },

    /// Registration succeeded but no identifier header came back.
    #[error("response is missing the Lambda-Extension-Identifier header")]
    MissingIdentifier,

    /// The response body could not be decoded.
    #[error("malformed extensions API response")]
    Decode(#[source] serde_json::Error),
}

/// Operations the lifecycle manager needs from the host control API.
pub trait ExtensionsApi {
    /// Registers the extension for INVOKE and SHUTDOWN events.
    ///
    /// Must be called exactly once, before any other call.
    fn register(&self, name: &str) -> impl Future<Output = Result<Registration>> + Send;

    /// Blocks until the host delivers the next lifecycle event.
    ///
    /// Returns [`ExtensionError::Cancelled`] as soon as `cancel` fires.
    fn next_event(
        &self,
        id: &ExtensionId,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<LifecycleEvent>> + Send;

    /// Reports a failure that happened before the first poll.
    fn report_init_error(
        &self,
        _id: &ExtensionId,
        _error: &ExtensionError,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Reports a failure that is ending the extension.
    fn report_exit_error(
        &self,
        _id: &ExtensionId,
        _error: &ExtensionError,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    events: &'a [EventType],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorRequest<'a> {
    error_message: String,
    error_type: &'a str,
}

/// HTTP client for the Lambda Extensions API.
#[derive(Debug, Clone)]
pub struct ExtensionsClient {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl ExtensionsClient {
    /// Creates a client for the runtime API at `runtime_api`.
    ///
    /// Accepts either the bare `host:port` form found in
    /// `AWS_LAMBDA_RUNTIME_API` or a full URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(runtime_api: &str) -> std::result::Result<Self, ApiError> {
        // No client-wide timeout: the host holds /event/next open for as
        // long as the environment is idle.
        let client = reqwest::Client::builder()
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            client,
            base_url: base_url(runtime_api),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Sets the timeout used for registration and error reports.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the base URL all API paths are resolved against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn fetch_next(&self, id: &ExtensionId) -> std::result::Result<LifecycleEvent, ApiError> {
        let response = self
            .client
            .get(self.url("event/next"))
            .header(EXTENSION_ID_HEADER, id.as_str())
            .send()
            .await
            .map_err(ApiError::Transport)?;

        let response = ensure_success(response).await?;
        let body = response.bytes().await.map_err(ApiError::Transport)?;

        serde_json::from_slice(&body).map_err(ApiError::Decode)
    }

    async fn report_error(&self, path: &str, id: &ExtensionId, error: &ExtensionError) {
        let error_type = error.error_type();
        let request = ErrorRequest {
            error_message: error_chain(error),
            error_type,
        };

        let result = self
            .client
            .post(self.url(path))
            .timeout(self.request_timeout)
            .header(EXTENSION_ID_HEADER, id.as_str())
            .header(ERROR_TYPE_HEADER, error_type)
            .json(&request)
            .send()
            .await
            .map_err(ApiError::Transport);

        let result = match result {
            Ok(response) => ensure_success(response).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => tracing::debug!(path, error_type, "Reported error to extensions API"),
            Err(e) => tracing::warn!(path, error = %e, "Failed to report error to extensions API"),
        }
    }
}

impl ExtensionsApi for ExtensionsClient {
    async fn register(&self, name: &str) -> Result<Registration> {
        let response = self
            .client
            .post(self.url("register"))
            .timeout(self.request_timeout)
            .header(EXTENSION_NAME_HEADER, name)
            .json(&RegisterRequest {
                events: &[EventType::Invoke, EventType::Shutdown],
            })
            .send()
            .await
            .map_err(|e| ExtensionError::Registration(ApiError::Transport(e)))?;

        let response = ensure_success(response)
            .await
            .map_err(ExtensionError::Registration)?;

        let headers = response.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let id = header(EXTENSION_ID_HEADER)
            .filter(|id| !id.is_empty())
            .ok_or(ExtensionError::Registration(ApiError::MissingIdentifier))?;

        Ok(Registration {
            id: ExtensionId::new(id),
            function_name: header(FUNCTION_NAME_HEADER),
            function_version: header(FUNCTION_VERSION_HEADER),
        })
    }

    async fn next_event(
        &self,
        id: &ExtensionId,
        cancel: &CancellationToken,
    ) -> Result<LifecycleEvent> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExtensionError::Cancelled),
            result = self.fetch_next(id) => result.map_err(ExtensionError::Poll),
        }
    }

    async fn report_init_error(&self, id: &ExtensionId, error: &ExtensionError) {
        self.report_error("init/error", id, error).await;
    }

    async fn report_exit_error(&self, id: &ExtensionId, error: &ExtensionError) {
        self.report_error("exit/error", id, error).await;
    }
}

async fn ensure_success(
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

fn base_url(runtime_api: &str) -> String {
    let runtime_api = runtime_api.trim_end_matches('/');
    if runtime_api.starts_with("http://") || runtime_api.starts_with("https://") {
        format!("{}/{}", runtime_api, API_VERSION_PATH)
    } else {
        format!("http://{}/{}", runtime_api, API_VERSION_PATH)
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SpawnError;
    use std::path::PathBuf;

    #[test]
    fn test_base_url_from_host_port() {
        assert_eq!(
            base_url("127.0.0.1:9001"),
            "http://127.0.0.1:9001/2020-01-01/extension"
        );
    }

    #[test]
    fn test_base_url_from_full_url() {
        assert_eq!(
            base_url("http://localhost:9001/"),
            "http://localhost:9001/2020-01-01/extension"
        );
    }

    #[test]
    fn test_client_urls() {
        let client = ExtensionsClient::new("localhost:9001").unwrap();
        assert_eq!(
            client.url("event/next"),
            "http://localhost:9001/2020-01-01/extension/event/next"
        );
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = ExtensionError::Start(SpawnError::NotFound(PathBuf::from("/opt/otelcol")));
        let message = error_chain(&err);

        assert!(message.starts_with("failed to start collector: "));
        assert!(message.contains("/opt/otelcol"));
    }

    #[test]
    fn test_register_request_body() {
        let body = serde_json::to_value(RegisterRequest {
            events: &[EventType::Invoke, EventType::Shutdown],
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "events": ["INVOKE", "SHUTDOWN"] }));
    }

    #[tokio::test]
    async fn test_next_event_returns_cancelled_when_token_fired() {
        // Nothing listens on port 9; the cancelled branch must win regardless.
        let client = ExtensionsClient::new("127.0.0.1:9").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client
            .next_event(&ExtensionId::new("ext-1"), &cancel)
            .await;
        assert!(matches!(result, Err(ExtensionError::Cancelled)));
    }
}
