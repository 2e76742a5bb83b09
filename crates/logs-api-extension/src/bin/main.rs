// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use logs_api_extension::{
    agent::LogsAgent,
    config::Config,
    logger,
    sink::{DiscardSink, HttpForwarder, LogSink},
};

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            // The subscriber is not installed yet, the level is part of the configuration.
            eprintln!("{} | ERROR | {e}", logger::LOG_PREFIX);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logger::init(&config.log_level) {
        eprintln!("{} | ERROR | Failed to set up logging: {e}", logger::LOG_PREFIX);
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let sink: Arc<dyn LogSink> = match &config.collector_url {
        Some(url) => {
            info!("Forwarding log batches to {url}");
            Arc::new(HttpForwarder::new(url))
        }
        None => {
            info!("No collector configured, log batches will be discarded");
            Arc::new(DiscardSink)
        }
    };

    let agent = LogsAgent::new(&config, sink);
    let cancel = CancellationToken::new();

    if let Err(e) = agent.init(&cancel).await {
        error!("Unable to start logs extension: {e}");
        return ExitCode::FAILURE;
    }

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        stop_signal().await;
        signal_cancel.cancel();
    });

    let result = agent.run(&cancel).await;
    agent.shutdown().await;

    match result {
        Ok(()) => {
            info!("Logs extension stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Logs extension stopped with an error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on SIGTERM or ctrl-c.
#[cfg(unix)]
async fn stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Unable to listen for SIGTERM: {e}");
            return interrupt().await;
        }
    };
    tokio::select! {
        Some(()) = sigterm.recv() => debug!("Received SIGTERM, stopping event loop"),
        () = interrupt() => {}
    }
}

#[cfg(not(unix))]
async fn stop_signal() {
    interrupt().await;
}

async fn interrupt() {
    if tokio::signal::ctrl_c().await.is_err() {
        return std::future::pending().await;
    }
    debug!("Received interrupt, stopping event loop");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::signal::unix::{signal, SignalKind};

    #[tokio::test]
    async fn test_sigterm_stops_the_loop() {
        // Installing a handler first replaces the default disposition, so the test process
        // survives the signal.
        let _sigterm = signal(SignalKind::terminate()).expect("register SIGTERM");
        let stop = tokio::spawn(stop_signal());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .expect("kill should run");
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(2), stop)
            .await
            .expect("SIGTERM should resolve the stop signal")
            .expect("task should not panic");
    }
}
