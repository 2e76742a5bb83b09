// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client shared by the runtime API clients and the collector forwarder.
//!
//! Each client builds one `reqwest::Client` at construction and reuses it for every call,
//! keeping connections to the runtime API alive between invocations.
//!
//! No request timeout is configured: `/event/next` is a long poll that only returns when the
//! host has an event, so bounding it would break the event loop. Callers bound calls through
//! cancellation instead.

use crate::error::ExtensionError;
use core::time::Duration;
use serde::de::DeserializeOwned;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(270);

#[must_use]
pub fn get_client() -> reqwest::Client {
    match build_client() {
        Ok(client) => client,
        Err(e) => {
            error!("Unable to build HTTP client: {e}, using reqwest defaults");
            reqwest::Client::new()
        }
    }
}

fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .tcp_keepalive(Duration::from_secs(120))
        .tcp_nodelay(true)
        .build()
}

/// Runs `fut` unless `cancel` fires first. Cancellation wins ties so a loop that has already
/// been asked to stop never starts another request.
pub(crate) async fn with_cancel<F, T>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, ExtensionError>
where
    F: Future<Output = Result<T, ExtensionError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ExtensionError::Cancelled),
        res = fut => res,
    }
}

/// Checks the status of a runtime API response and decodes its JSON body.
///
/// An empty body decodes as `T::default()`; the error endpoints are not guaranteed to return one.
pub(crate) async fn read_json<T>(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<T, ExtensionError>
where
    T: DeserializeOwned + Default,
{
    let status = response.status();
    if !status.is_success() {
        debug!("{endpoint} returned {status}");
        return Err(ExtensionError::Protocol { endpoint, status });
    }
    let body = response.bytes().await?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(&body)?)
}
