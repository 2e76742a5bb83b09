// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ties the listener and both runtime API clients together.
//!
//! Start-up order matters: the listener must accept connections before the subscription is sent,
//! or the host may drop its first deliveries, and the subscription needs the identifier returned
//! by registration.
//!
//! ```text
//!   start listener ──> register ──> subscribe(destination = listener) ──> run ──> shutdown
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AgentError, ExtensionError};
use crate::extension_api::{EventType, ExtensionApiClient, ExtensionId};
use crate::listener::{ListenerConfig, ListenerEvent, ListenerState, LogsListener};
use crate::logs_api::{BufferingConfig, Destination, LogType, LogsApiClient};
use crate::sink::LogSink;

/// Categories subscribed to by default. Extension logs are left out: they are this process's
/// own output.
pub const DEFAULT_LOG_TYPES: [LogType; 2] = [LogType::Platform, LogType::Function];
const ERROR_REPORT_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound for the sink to finish deliveries still in flight at shutdown.
pub const SINK_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct LogsAgent {
    extension_name: String,
    extension_api: ExtensionApiClient,
    logs_api: LogsApiClient,
    listener: LogsListener,
    log_types: Vec<LogType>,
    buffering: BufferingConfig,
}

impl LogsAgent {
    /// Builds an agent with the listener address derived from `config`.
    #[must_use]
    pub fn new(config: &Config, sink: Arc<dyn LogSink>) -> Self {
        let listener = LogsListener::new(ListenerConfig::from_config(config), sink);
        Self::with_listener(config, listener)
    }

    #[must_use]
    pub fn with_listener(config: &Config, listener: LogsListener) -> Self {
        Self {
            extension_name: config.extension_name.clone(),
            extension_api: ExtensionApiClient::new(&config.runtime_api),
            logs_api: LogsApiClient::new(&config.runtime_api),
            listener,
            log_types: DEFAULT_LOG_TYPES.to_vec(),
            buffering: BufferingConfig::default(),
        }
    }

    #[must_use]
    pub fn with_log_types(mut self, log_types: Vec<LogType>) -> Self {
        self.log_types = log_types;
        self
    }

    #[must_use]
    pub fn with_buffering(mut self, buffering: BufferingConfig) -> Self {
        self.buffering = buffering;
        self
    }

    pub fn listener(&self) -> &LogsListener {
        &self.listener
    }

    pub fn extension_id(&self) -> Option<&ExtensionId> {
        self.extension_api.extension_id()
    }

    /// Starts the listener, registers and subscribes.
    ///
    /// On failure the listener is stopped again, and when registration already succeeded the
    /// failure is reported to the host through `/init/error`. Cancellation is not reported.
    pub async fn init(&self, cancel: &CancellationToken) -> Result<ExtensionId, AgentError> {
        if self.log_types.is_empty() {
            return Err(AgentError::Config(
                "At least one log type must be subscribed".to_string(),
            ));
        }
        self.buffering
            .validate()
            .map_err(|e| AgentError::Config(e.to_string()))?;

        let addr = self.listener.start().await.map_err(AgentError::Listener)?;

        match self.register_and_subscribe(cancel, addr).await {
            Ok(id) => {
                info!(
                    "Extension {} subscribed to {:?} logs",
                    self.extension_name, self.log_types
                );
                Ok(id)
            }
            Err(e) if e.is_cancelled() => {
                debug!("Extension initialization cancelled");
                self.listener.shutdown().await;
                Err(e)
            }
            Err(e) => {
                error!("Extension initialization failed: {e}");
                if self.extension_api.extension_id().is_some() {
                    self.report_init_error(e.error_type()).await;
                }
                self.listener.shutdown().await;
                Err(e)
            }
        }
    }

    async fn register_and_subscribe(
        &self,
        cancel: &CancellationToken,
        addr: std::net::SocketAddr,
    ) -> Result<ExtensionId, AgentError> {
        self.extension_api
            .register(&self.extension_name)
            .await
            .map_err(AgentError::Register)?;
        let id = self
            .extension_api
            .extension_id()
            .cloned()
            .ok_or(AgentError::Register(ExtensionError::MissingIdentifier))?;
        debug!("Registered with extension id {id}");

        let destination = Destination::http(self.listener.destination_uri(addr));
        self.logs_api
            .subscribe(cancel, &self.log_types, self.buffering, &destination, &id)
            .await
            .map_err(AgentError::Subscribe)?;

        Ok(id)
    }

    /// Polls for events until `SHUTDOWN`, cancellation, or a failure.
    ///
    /// A failed poll or a listener that stopped on its own ends the loop; the reason is reported
    /// to the host through `/exit/error` before returning.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        if self.listener.state() == ListenerState::Stopped {
            let e = AgentError::ListenerFailed("listener is not running".to_string());
            self.report_exit_error(e.error_type()).await;
            return Err(e);
        }

        let failure = wait_for_listener_failure(self.listener.events());
        tokio::pin!(failure);

        loop {
            let next = tokio::select! {
                reason = &mut failure => {
                    let e = AgentError::ListenerFailed(reason);
                    error!("{e}");
                    self.report_exit_error(e.error_type()).await;
                    return Err(e);
                }
                next = self.extension_api.next_event(cancel) => next,
            };

            match next {
                Ok(event) => match event.event_type {
                    EventType::Invoke => {
                        debug!("Received INVOKE event for request {}", event.request_id);
                    }
                    EventType::Shutdown => {
                        info!(
                            "Received SHUTDOWN event, reason: {}",
                            event.shutdown_reason.as_deref().unwrap_or("unknown")
                        );
                        return Ok(());
                    }
                    EventType::Unknown => warn!("Ignoring event of unknown type"),
                },
                Err(ExtensionError::Cancelled) => {
                    debug!("Event loop cancelled");
                    return Ok(());
                }
                Err(e) => {
                    let e = AgentError::EventLoop(e);
                    error!("{e}");
                    self.report_exit_error(e.error_type()).await;
                    return Err(e);
                }
            }
        }
    }

    /// Stops the listener, then waits up to [`SINK_FLUSH_TIMEOUT`] for the sink to finish what
    /// it already accepted. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.listener.shutdown().await;
        if tokio::time::timeout(SINK_FLUSH_TIMEOUT, self.listener.sink().flush())
            .await
            .is_err()
        {
            warn!("Log sink did not flush within {SINK_FLUSH_TIMEOUT:?}");
        }
    }

    async fn report_init_error(&self, error_type: &str) {
        let cancel = CancellationToken::new();
        let report = self.extension_api.init_error(&cancel, error_type);
        match tokio::time::timeout(ERROR_REPORT_TIMEOUT, report).await {
            Ok(Ok(_)) => debug!("Reported init error {error_type}"),
            Ok(Err(e)) => warn!("Failed to report init error {error_type}: {e}"),
            Err(_) => warn!("Timed out reporting init error {error_type}"),
        }
    }

    async fn report_exit_error(&self, error_type: &str) {
        let cancel = CancellationToken::new();
        let report = self.extension_api.exit_error(&cancel, error_type);
        match tokio::time::timeout(ERROR_REPORT_TIMEOUT, report).await {
            Ok(Ok(_)) => debug!("Reported exit error {error_type}"),
            Ok(Err(e)) => warn!("Failed to report exit error {error_type}: {e}"),
            Err(_) => warn!("Timed out reporting exit error {error_type}"),
        }
    }
}

/// Resolves with the error message once the listener reports a fatal failure.
async fn wait_for_listener_failure(mut events: broadcast::Receiver<ListenerEvent>) -> String {
    loop {
        match events.recv().await {
            Ok(ListenerEvent::Failed { error, .. }) => return error,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return std::future::pending().await,
        }
    }
}
