// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ExtensionError;
use std::env;

pub const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";
pub const SAM_LOCAL_ENV: &str = "AWS_SAM_LOCAL";
pub const LISTENER_PORT_ENV: &str = "EXTENSION_LISTENER_PORT";
pub const DEFAULT_LISTENER_PORT: u16 = 1234;
const DEFAULT_EXTENSION_NAME: &str = "logs-api-extension";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration for the logs extension, read once at start-up.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host and port of the Lambda runtime API (e.g. `127.0.0.1:9001`)
    pub runtime_api: String,
    /// Name registered with the Extensions API. Must match the executable's file name.
    pub extension_name: String,
    /// Whether we run under `sam local`, which changes the listener address
    pub sam_local: bool,
    /// Port the logs listener binds to
    pub listener_port: u16,
    /// Optional URL each received log batch is forwarded to
    pub collector_url: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ExtensionError> {
        let runtime_api = env::var(RUNTIME_API_ENV)
            .map_err(|_| ExtensionError::Config(format!("{RUNTIME_API_ENV} is not set")))?;
        let sam_local = env::var(SAM_LOCAL_ENV)
            .map(|val| val == "true")
            .unwrap_or(false);
        let listener_port = match env::var(LISTENER_PORT_ENV) {
            Ok(port) => port.trim().parse::<u16>().map_err(|e| {
                ExtensionError::Config(format!("Invalid {LISTENER_PORT_ENV} '{port}': {e}"))
            })?,
            Err(_) => DEFAULT_LISTENER_PORT,
        };
        let collector_url = env::var("EXTENSION_LOGS_COLLECTOR_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        let log_level = env::var("EXTENSION_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());
        let extension_name = env::var("EXTENSION_NAME")
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(executable_name);

        let config = Self {
            runtime_api,
            extension_name,
            sam_local,
            listener_port,
            collector_url,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ExtensionError> {
        if self.runtime_api.trim().is_empty() {
            return Err(ExtensionError::Config(format!(
                "{RUNTIME_API_ENV} cannot be empty"
            )));
        }

        if self.listener_port == 0 {
            return Err(ExtensionError::Config(
                "Listener port must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ExtensionError::Config(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

/// The Extensions API identifies an extension by the file name it was launched from.
fn executable_name() -> String {
    env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_EXTENSION_NAME.to_string())
}
