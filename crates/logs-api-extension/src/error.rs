// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;
use std::net::SocketAddr;

/// Errors returned by the Extensions API and Logs API clients.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Request to {endpoint} failed with status {status}")]
    Protocol {
        endpoint: &'static str,
        status: StatusCode,
    },

    #[error("Failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Register response did not carry an extension identifier")]
    MissingIdentifier,

    #[error("Extension is not registered")]
    NotRegistered,
}

impl ExtensionError {
    /// Value sent in the `Lambda-Extension-Function-Error-Type` header when this error is
    /// reported to the host. The platform expects a `Category.Reason` shape.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Transport(_) => "Extension.TransportError",
            Self::Protocol { .. } => "Extension.ProtocolError",
            Self::Decode(_) => "Extension.DecodeError",
            Self::Config(_) => "Extension.ConfigError",
            Self::Cancelled => "Extension.Cancelled",
            Self::MissingIdentifier => "Extension.MissingIdentifier",
            Self::NotRegistered => "Extension.NotRegistered",
        }
    }
}

/// Errors raised by the local ingestion listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Listener already running on {0}")]
    AlreadyRunning(SocketAddr),
}

/// Aggregated error for the agent start-up sequence, tagged with the step that failed.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to start logs listener: {0}")]
    Listener(#[source] ListenerError),

    #[error("Failed to register extension: {0}")]
    Register(#[source] ExtensionError),

    #[error("Failed to subscribe to logs: {0}")]
    Subscribe(#[source] ExtensionError),

    #[error("Event loop failed: {0}")]
    EventLoop(#[source] ExtensionError),

    #[error("Logs listener failed: {0}")]
    ListenerFailed(String),
}

impl AgentError {
    /// The step was interrupted by the caller rather than failing.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Register(ExtensionError::Cancelled)
                | Self::Subscribe(ExtensionError::Cancelled)
                | Self::EventLoop(ExtensionError::Cancelled)
        )
    }

    /// Value reported to the host through `/init/error` or `/exit/error`.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Config(_) => "Extension.ConfigError",
            Self::Listener(_) => "Extension.ListenerError",
            Self::ListenerFailed(_) => "Extension.ListenerFailed",
            Self::Register(e) | Self::Subscribe(e) | Self::EventLoop(e) => e.error_type(),
        }
    }
}
