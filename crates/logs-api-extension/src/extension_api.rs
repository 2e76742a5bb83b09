// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the Lambda Extensions API.
//!
//! The extension registers once, then long-polls `/event/next` until the host sends `SHUTDOWN`.
//! The identifier handed out on registration is carried on every later request, including the
//! Logs API subscription.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{OnceCell, SetError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExtensionError;
use crate::http::{get_client, read_json, with_cancel};

pub const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
pub const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";
pub const EXTENSION_ERROR_TYPE_HEADER: &str = "Lambda-Extension-Function-Error-Type";

const EXTENSION_API_VERSION: &str = "2020-01-01";
const REGISTER_PATH: &str = "/register";
const NEXT_EVENT_PATH: &str = "/event/next";
const INIT_ERROR_PATH: &str = "/init/error";
const EXIT_ERROR_PATH: &str = "/exit/error";

/// Opaque identifier issued by the Extensions API on registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtensionId(String);

impl ExtensionId {
    /// Returns `None` for an empty token; the platform never issues one.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event types an extension can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Invoke,
    Shutdown,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    events: &'a [EventType],
}

/// Body of the `/register` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterResponse {
    pub function_name: String,
    pub function_version: String,
    pub handler: String,
}

/// Tracing header forwarded with an `INVOKE` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Tracing {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// Body of the `/event/next` response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEventResponse {
    pub event_type: EventType,
    #[serde(default)]
    pub deadline_ms: i64,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub invoked_function_arn: String,
    #[serde(default)]
    pub tracing: Tracing,
    /// Only present on `SHUTDOWN` (e.g. `spindown`, `timeout`, `failure`)
    #[serde(default)]
    pub shutdown_reason: Option<String>,
}

// `read_json` needs a fallback for empty bodies; an empty next-event body is not a valid event.
impl Default for NextEventResponse {
    fn default() -> Self {
        Self {
            event_type: EventType::Unknown,
            deadline_ms: 0,
            request_id: String::new(),
            invoked_function_arn: String::new(),
            tracing: Tracing::default(),
            shutdown_reason: None,
        }
    }
}

/// Body of the `/init/error` and `/exit/error` responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StatusResponse {
    pub status: String,
}

/// Extensions API client. Holds one HTTP client for its whole lifetime.
#[derive(Debug)]
pub struct ExtensionApiClient {
    base_url: String,
    client: reqwest::Client,
    extension_id: OnceCell<ExtensionId>,
}

impl ExtensionApiClient {
    /// `runtime_api` is the `host:port` advertised in `AWS_LAMBDA_RUNTIME_API`.
    #[must_use]
    pub fn new(runtime_api: &str) -> Self {
        Self::with_base_url(format!(
            "http://{runtime_api}/{EXTENSION_API_VERSION}/extension"
        ))
    }

    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: get_client(),
            extension_id: OnceCell::new(),
        }
    }

    /// The identifier obtained from a successful registration, if any.
    pub fn extension_id(&self) -> Option<&ExtensionId> {
        self.extension_id.get()
    }

    fn registered_id(&self) -> Result<&ExtensionId, ExtensionError> {
        self.extension_id.get().ok_or(ExtensionError::NotRegistered)
    }

    /// Registers for `INVOKE` and `SHUTDOWN` events under `name`.
    ///
    /// The identifier is taken from the response header, not the body. Registering again is
    /// allowed by the protocol, but the first identifier is kept for the life of the process.
    pub async fn register(&self, name: &str) -> Result<RegisterResponse, ExtensionError> {
        let url = format!("{}{REGISTER_PATH}", self.base_url);
        let body = RegisterRequest {
            events: &[EventType::Invoke, EventType::Shutdown],
        };

        let response = self
            .client
            .post(&url)
            .header(EXTENSION_NAME_HEADER, name)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ExtensionError::Protocol {
                endpoint: REGISTER_PATH,
                status: response.status(),
            });
        }

        let id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(ExtensionId::new)
            .ok_or(ExtensionError::MissingIdentifier)?;

        let register_response: RegisterResponse = read_json(REGISTER_PATH, response).await?;

        let rejected = match self.extension_id.set(id) {
            Ok(()) => None,
            Err(SetError::AlreadyInitializedError(id) | SetError::InitializingError(id)) => {
                Some(id)
            }
        };
        if rejected.is_some_and(|id| self.extension_id.get() != Some(&id)) {
            warn!("Extension re-registered with a new identifier, keeping the original one");
        }
        debug!(
            "Registered extension {name} for function {}",
            register_response.function_name
        );

        Ok(register_response)
    }

    /// Long-polls for the next event. Blocks until the host has one or `cancel` fires.
    pub async fn next_event(
        &self,
        cancel: &CancellationToken,
    ) -> Result<NextEventResponse, ExtensionError> {
        let id = self.registered_id()?;
        let url = format!("{}{NEXT_EVENT_PATH}", self.base_url);

        with_cancel(cancel, async {
            let response = self
                .client
                .get(&url)
                .header(EXTENSION_ID_HEADER, id.as_str())
                .send()
                .await?;
            let event: NextEventResponse = read_json(NEXT_EVENT_PATH, response).await?;
            Ok(event)
        })
        .await
    }

    /// Tells the host the extension failed to initialize.
    pub async fn init_error(
        &self,
        cancel: &CancellationToken,
        error_type: &str,
    ) -> Result<StatusResponse, ExtensionError> {
        self.report_error(cancel, INIT_ERROR_PATH, error_type).await
    }

    /// Tells the host the extension is exiting because of an error.
    pub async fn exit_error(
        &self,
        cancel: &CancellationToken,
        error_type: &str,
    ) -> Result<StatusResponse, ExtensionError> {
        self.report_error(cancel, EXIT_ERROR_PATH, error_type).await
    }

    async fn report_error(
        &self,
        cancel: &CancellationToken,
        endpoint: &'static str,
        error_type: &str,
    ) -> Result<StatusResponse, ExtensionError> {
        let id = self.registered_id()?;
        let url = format!("{}{endpoint}", self.base_url);

        with_cancel(cancel, async {
            let response = self
                .client
                .post(&url)
                .header(EXTENSION_ID_HEADER, id.as_str())
                .header(EXTENSION_ERROR_TYPE_HEADER, error_type)
                .send()
                .await?;
            read_json(endpoint, response).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    const REGISTER_BODY: &str =
        r#"{"functionName":"my-fn","functionVersion":"$LATEST","handler":"index.handler"}"#;
    const NEXT_INVOKE_BODY: &str = r#"{
        "eventType": "INVOKE",
        "deadlineMs": 1676051941000,
        "requestId": "3da1f2dc-3222-475e-9205-e2e6c6318895",
        "invokedFunctionArn": "arn:aws:lambda:us-east-1:123456789012:function:my-fn",
        "tracing": {
            "type": "X-Amzn-Trace-Id",
            "value": "Root=1-5759e988-bd862e3fe1be46a994272793;Parent=53995c3f42cd8ad8;Sampled=1"
        }
    }"#;

    async fn registered_client(server: &mut mockito::ServerGuard) -> ExtensionApiClient {
        let _mock = server
            .mock("POST", "/2020-01-01/extension/register")
            .with_status(200)
            .with_header(EXTENSION_ID_HEADER, "test-extension-id")
            .with_body(REGISTER_BODY)
            .create_async()
            .await;
        let client = ExtensionApiClient::new(&server.host_with_port());
        client.register("test-ext").await.expect("register should succeed");
        client
    }

    #[test]
    fn test_extension_id_rejects_empty() {
        assert!(ExtensionId::new("").is_none());
        assert_eq!(ExtensionId::new("abc").expect("valid id").as_str(), "abc");
    }

    #[test]
    fn test_decode_shutdown_event() {
        let body = r#"{"eventType":"SHUTDOWN","shutdownReason":"spindown","deadlineMs":42}"#;
        let event: NextEventResponse = serde_json::from_str(body).expect("should decode");
        assert_eq!(event.event_type, EventType::Shutdown);
        assert_eq!(event.shutdown_reason.as_deref(), Some("spindown"));
        assert_eq!(event.deadline_ms, 42);
        assert!(event.request_id.is_empty());
    }

    #[test]
    fn test_decode_unknown_event_type() {
        let body = r#"{"eventType":"RESTORE"}"#;
        let event: NextEventResponse = serde_json::from_str(body).expect("should decode");
        assert_eq!(event.event_type, EventType::Unknown);
    }

    #[tokio::test]
    async fn test_register_stores_identifier_from_header() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/2020-01-01/extension/register")
            .match_header(EXTENSION_NAME_HEADER, "test-ext")
            .match_body(Matcher::Json(serde_json::json!({
                "events": ["INVOKE", "SHUTDOWN"]
            })))
            .with_status(200)
            .with_header(EXTENSION_ID_HEADER, "test-extension-id")
            .with_body(REGISTER_BODY)
            .create_async()
            .await;

        let client = ExtensionApiClient::new(&server.host_with_port());
        assert!(client.extension_id().is_none());

        let response = client.register("test-ext").await.expect("register should succeed");

        mock.assert_async().await;
        assert_eq!(response.function_name, "my-fn");
        assert_eq!(
            client.extension_id().map(ExtensionId::as_str),
            Some("test-extension-id")
        );
    }

    #[tokio::test]
    async fn test_register_non_success_is_protocol_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/2020-01-01/extension/register")
            .with_status(500)
            .create_async()
            .await;

        let client = ExtensionApiClient::new(&server.host_with_port());
        let err = client.register("test-ext").await.expect_err("should fail");

        assert!(matches!(
            err,
            ExtensionError::Protocol {
                endpoint: REGISTER_PATH,
                status
            } if status == reqwest::StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert!(client.extension_id().is_none());
    }

    #[tokio::test]
    async fn test_register_without_identifier_header_fails() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/2020-01-01/extension/register")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = ExtensionApiClient::new(&server.host_with_port());
        let err = client.register("test-ext").await.expect_err("should fail");
        assert!(matches!(err, ExtensionError::MissingIdentifier));
    }

    #[tokio::test]
    async fn test_register_connection_failure_is_transport_error() {
        // Nothing listens on port 9 on the loopback interface
        let client = ExtensionApiClient::new("127.0.0.1:9");
        let err = client.register("test-ext").await.expect_err("should fail");
        assert!(matches!(err, ExtensionError::Transport(_)));
    }

    #[tokio::test]
    async fn test_register_twice_keeps_first_identifier() {
        let mut server = Server::new_async().await;
        let client = registered_client(&mut server).await;

        server.reset();
        let _mock = server
            .mock("POST", "/2020-01-01/extension/register")
            .with_status(200)
            .with_header(EXTENSION_ID_HEADER, "another-id")
            .with_body("{}")
            .create_async()
            .await;

        client.register("test-ext").await.expect("re-register should succeed");
        assert_eq!(
            client.extension_id().map(ExtensionId::as_str),
            Some("test-extension-id")
        );
    }

    #[tokio::test]
    async fn test_next_event_before_register_fails() {
        let client = ExtensionApiClient::new("127.0.0.1:9");
        let err = client
            .next_event(&CancellationToken::new())
            .await
            .expect_err("should fail");
        assert!(matches!(err, ExtensionError::NotRegistered));
    }

    #[tokio::test]
    async fn test_next_event_sends_identifier() {
        let mut server = Server::new_async().await;
        let client = registered_client(&mut server).await;
        let mock = server
            .mock("GET", "/2020-01-01/extension/event/next")
            .match_header(EXTENSION_ID_HEADER, "test-extension-id")
            .with_status(200)
            .with_body(NEXT_INVOKE_BODY)
            .create_async()
            .await;

        let event = client
            .next_event(&CancellationToken::new())
            .await
            .expect("next event should succeed");

        mock.assert_async().await;
        assert_eq!(event.event_type, EventType::Invoke);
        assert_eq!(event.request_id, "3da1f2dc-3222-475e-9205-e2e6c6318895");
        assert_eq!(event.tracing.kind, "X-Amzn-Trace-Id");
        assert_eq!(event.deadline_ms, 1_676_051_941_000);
    }

    #[tokio::test]
    async fn test_next_event_malformed_body_is_decode_error() {
        let mut server = Server::new_async().await;
        let client = registered_client(&mut server).await;
        let _mock = server
            .mock("GET", "/2020-01-01/extension/event/next")
            .with_status(200)
            .with_body("{not json")
            .create_async()
            .await;

        let err = client
            .next_event(&CancellationToken::new())
            .await
            .expect_err("should fail");
        assert!(matches!(err, ExtensionError::Decode(_)));
    }

    #[tokio::test]
    async fn test_next_event_cancelled_while_waiting() {
        let mut server = Server::new_async().await;
        let client = registered_client(&mut server).await;

        // Accepts connections and never answers, like a long poll with no pending event.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = ExtensionApiClient {
            base_url: format!("http://{addr}/2020-01-01/extension"),
            ..client
        };

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = client.next_event(&cancel).await.expect_err("should be cancelled");
        assert!(matches!(err, ExtensionError::Cancelled));
    }

    #[tokio::test]
    async fn test_exit_error_sends_error_type() {
        let mut server = Server::new_async().await;
        let client = registered_client(&mut server).await;
        let mock = server
            .mock("POST", "/2020-01-01/extension/exit/error")
            .match_header(EXTENSION_ID_HEADER, "test-extension-id")
            .match_header(EXTENSION_ERROR_TYPE_HEADER, "Extension.ProtocolError")
            .with_status(202)
            .with_body(r#"{"status":"OK"}"#)
            .create_async()
            .await;

        let response = client
            .exit_error(&CancellationToken::new(), "Extension.ProtocolError")
            .await
            .expect("exit error should succeed");

        mock.assert_async().await;
        assert_eq!(response.status, "OK");
    }

    #[tokio::test]
    async fn test_init_error_accepts_empty_body() {
        let mut server = Server::new_async().await;
        let client = registered_client(&mut server).await;
        let mock = server
            .mock("POST", "/2020-01-01/extension/init/error")
            .match_header(EXTENSION_ERROR_TYPE_HEADER, "Extension.ConfigError")
            .with_status(202)
            .create_async()
            .await;

        let response = client
            .init_error(&CancellationToken::new(), "Extension.ConfigError")
            .await
            .expect("init error should succeed");

        mock.assert_async().await;
        assert_eq!(response, StatusResponse::default());
    }

    #[tokio::test]
    async fn test_init_error_failure_status() {
        let mut server = Server::new_async().await;
        let client = registered_client(&mut server).await;
        let _mock = server
            .mock("POST", "/2020-01-01/extension/init/error")
            .with_status(403)
            .create_async()
            .await;

        let err = client
            .init_error(&CancellationToken::new(), "Extension.ConfigError")
            .await
            .expect_err("should fail");
        assert!(matches!(err, ExtensionError::Protocol { endpoint: INIT_ERROR_PATH, .. }));
    }
}
