// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destinations for log batches received from the Logs API.
//!
//! A sink is deliberately separate from the `tracing` pipeline. Diagnostic output of this
//! process ends up in the function's log stream, so a sink that logged what it received would
//! feed its own input back to itself. Sinks report problems through counters only.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::instrument::WithSubscriber;

use crate::http::get_client;

/// Raw payload pushed by the host. Content is not inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch(Bytes);

impl LogBatch {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Receives every batch accepted by the listener.
///
/// Implementations must not emit diagnostic logs and should return quickly; the host waits for
/// the HTTP response before pushing the next batch.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn deliver(&self, batch: LogBatch);

    /// Resolves once every batch accepted so far has left the sink.
    async fn flush(&self) {}
}

/// Drops every batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl LogSink for DiscardSink {
    async fn deliver(&self, _batch: LogBatch) {}
}

/// Hands batches to an in-process consumer over a bounded channel.
///
/// A full or closed channel drops the batch instead of applying backpressure to the host.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<LogBatch>,
    dropped: AtomicU64,
}

impl ChannelSink {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LogBatch>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LogSink for ChannelSink {
    async fn deliver(&self, batch: LogBatch) {
        if self.tx.try_send(batch).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Counters kept by [`HttpForwarder`].
#[derive(Debug, Default)]
pub struct ForwarderStats {
    pub forwarded: AtomicU64,
    pub failed: AtomicU64,
}

/// POSTs each batch, unchanged, to a collector URL.
///
/// Sends happen on tracked tasks so the listener can acknowledge the host right away, and
/// [`LogSink::flush`] can wait for them before the process exits.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    url: Arc<str>,
    client: reqwest::Client,
    stats: Arc<ForwarderStats>,
    tasks: TaskTracker,
}

impl HttpForwarder {
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: Arc::from(url),
            client: get_client(),
            stats: Arc::new(ForwarderStats::default()),
            tasks: TaskTracker::new(),
        }
    }

    pub fn stats(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl LogSink for HttpForwarder {
    async fn deliver(&self, batch: LogBatch) {
        let request = self
            .client
            .post(self.url.as_ref())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(batch.into_bytes());
        let stats = Arc::clone(&self.stats);
        // Keeps the caller's dispatcher, which is a `NoSubscriber` on the ingestion path.
        self.tasks.spawn(
            async move {
                let counter = match request.send().await {
                    Ok(response) if response.status().is_success() => &stats.forwarded,
                    _ => &stats.failed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            .with_current_subscriber(),
        );
    }

    async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use std::time::Duration;

    #[tokio::test]
    async fn test_channel_sink_delivers_bytes() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.deliver(LogBatch::new(&b"[{\"type\":\"function\"}]"[..]))
            .await;

        let batch = rx.recv().await.expect("batch should be delivered");
        assert_eq!(batch.as_bytes(), b"[{\"type\":\"function\"}]");
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, _rx) = ChannelSink::new(1);
        sink.deliver(LogBatch::new(&b"first"[..])).await;
        sink.deliver(LogBatch::new(&b"second"[..])).await;
        assert_eq!(sink.dropped(), 1);
    }

    #[tokio::test]
    async fn test_http_forwarder_posts_raw_batch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/logs")
            .match_header("Content-Type", "application/json")
            .match_body(r#"[{"record":"hello"}]"#)
            .with_status(202)
            .create_async()
            .await;

        let forwarder = HttpForwarder::new(&format!("{}/logs", server.url()));
        let stats = forwarder.stats();
        forwarder
            .deliver(LogBatch::new(&br#"[{"record":"hello"}]"#[..]))
            .await;

        let wait = async {
            while stats.forwarded.load(Ordering::Relaxed) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("batch should be forwarded");
        mock.assert_async().await;
        assert_eq!(stats.failed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_http_forwarder_flush_waits_for_in_flight_batches() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/logs")
            .with_status(200)
            .expect(5)
            .create_async()
            .await;

        let forwarder = HttpForwarder::new(&format!("{}/logs", server.url()));
        let stats = forwarder.stats();
        for i in 0..5 {
            forwarder
                .deliver(LogBatch::new(format!("[{i}]").into_bytes()))
                .await;
        }
        forwarder.flush().await;

        assert_eq!(stats.forwarded.load(Ordering::Relaxed), 5);
        assert_eq!(stats.failed.load(Ordering::Relaxed), 0);
        mock.assert_async().await;

        // Still usable after a flush.
        forwarder.deliver(LogBatch::new(&b"[5]"[..])).await;
        forwarder.flush().await;
        assert_eq!(
            stats.forwarded.load(Ordering::Relaxed) + stats.failed.load(Ordering::Relaxed),
            6
        );
    }

    #[tokio::test]
    async fn test_flush_without_deliveries_returns() {
        let forwarder = HttpForwarder::new("http://127.0.0.1:9/logs");
        tokio::time::timeout(Duration::from_secs(1), forwarder.flush())
            .await
            .expect("flush should not wait when nothing is in flight");
        DiscardSink.flush().await;
    }

    #[tokio::test]
    async fn test_http_forwarder_counts_failures() {
        let forwarder = HttpForwarder::new("http://127.0.0.1:9/logs");
        let stats = forwarder.stats();
        forwarder.deliver(LogBatch::new(&b"[]"[..])).await;

        let wait = async {
            while stats.failed.load(Ordering::Relaxed) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("failure should be counted");
        assert_eq!(stats.forwarded.load(Ordering::Relaxed), 0);
    }
}
