// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the Lambda Logs API subscription.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ExtensionError;
use crate::extension_api::{ExtensionId, EXTENSION_ID_HEADER};
use crate::http::{get_client, with_cancel};

/// Version of the subscription body; `2021-03-18` is the first one with `platform.runtimeDone`.
pub const LOGS_API_SCHEMA_VERSION: &str = "2021-03-18";
const LOGS_API_VERSION: &str = "2020-08-15";
const SUBSCRIBE_PATH: &str = "/logs";

pub const DEFAULT_MAX_ITEMS: u32 = 10_000;
pub const DEFAULT_MAX_BYTES: u32 = 262_144;
pub const DEFAULT_TIMEOUT_MS: u32 = 1_000;

/// Log categories the host can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Platform,
    Function,
    Extension,
}

/// How the host batches deliveries. A batch is pushed as soon as any one of the three bounds is
/// reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferingConfig {
    pub max_items: u32,
    pub max_bytes: u32,
    pub timeout_ms: u32,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            max_bytes: DEFAULT_MAX_BYTES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl BufferingConfig {
    /// Checks the bounds against the ranges the Logs API accepts.
    pub fn validate(&self) -> Result<(), ExtensionError> {
        if !(1_000..=10_000).contains(&self.max_items) {
            return Err(ExtensionError::Config(format!(
                "Buffering maxItems {} must be between 1000 and 10000",
                self.max_items
            )));
        }
        if !(262_144..=1_048_576).contains(&self.max_bytes) {
            return Err(ExtensionError::Config(format!(
                "Buffering maxBytes {} must be between 262144 and 1048576",
                self.max_bytes
            )));
        }
        if !(25..=30_000).contains(&self.timeout_ms) {
            return Err(ExtensionError::Config(format!(
                "Buffering timeoutMs {} must be between 25 and 30000",
                self.timeout_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Encoding {
    Json,
}

/// Where and how the host pushes log batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub protocol: Protocol,
    #[serde(rename = "URI")]
    pub uri: String,
    pub method: HttpMethod,
    pub encoding: Encoding,
}

impl Destination {
    /// JSON batches POSTed over HTTP to `uri`.
    #[must_use]
    pub fn http(uri: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Http,
            uri: uri.into(),
            method: HttpMethod::Post,
            encoding: Encoding::Json,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest<'a> {
    pub schema_version: &'static str,
    pub types: &'a [LogType],
    pub buffering: BufferingConfig,
    pub destination: &'a Destination,
}

/// Logs API client. Holds one HTTP client for its whole lifetime.
#[derive(Debug)]
pub struct LogsApiClient {
    url: String,
    client: reqwest::Client,
}

impl LogsApiClient {
    /// `runtime_api` is the `host:port` advertised in `AWS_LAMBDA_RUNTIME_API`.
    #[must_use]
    pub fn new(runtime_api: &str) -> Self {
        Self {
            url: format!("http://{runtime_api}/{LOGS_API_VERSION}{SUBSCRIBE_PATH}"),
            client: get_client(),
        }
    }

    /// Subscribes to `types`, delivered to `destination`. Not retried; the host either accepts
    /// the whole subscription or rejects it.
    ///
    /// Requiring an [`ExtensionId`] means this can only be called after a successful
    /// registration.
    pub async fn subscribe(
        &self,
        cancel: &CancellationToken,
        types: &[LogType],
        buffering: BufferingConfig,
        destination: &Destination,
        extension_id: &ExtensionId,
    ) -> Result<(), ExtensionError> {
        let body = SubscriptionRequest {
            schema_version: LOGS_API_SCHEMA_VERSION,
            types,
            buffering,
            destination,
        };

        with_cancel(cancel, async {
            let response = self
                .client
                .put(&self.url)
                .header(EXTENSION_ID_HEADER, extension_id.as_str())
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(ExtensionError::Protocol {
                    endpoint: SUBSCRIBE_PATH,
                    status,
                });
            }
            debug!("Subscribed to {types:?} logs at {}", destination.uri);
            Ok(())
        })
        .await
    }
}
