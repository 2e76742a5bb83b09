// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP listener receiving log batches pushed by the Logs API.
//!
//! The host posts batches to the destination URI given at subscription time. Each request body is
//! handed as-is to a [`LogSink`]. Everything that runs while serving a connection is executed
//! under a [`NoSubscriber`] dispatcher: anything logged there would be collected by the host and
//! pushed back to this listener.
//!
//! ```text
//!   Stopped ──start──> Running(addr) ──shutdown / fatal accept error──> Stopped
//! ```
//!
//! Running out of file descriptors is retried with a backoff. Any other accept error is fatal:
//! the listener stops on its own and publishes [`ListenerEvent::Failed`] so the owner can react.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::subscriber::NoSubscriber;
use tracing::{debug, error, warn};

use crate::config::{Config, DEFAULT_LISTENER_PORT};
use crate::error::ListenerError;
use crate::sink::{LogBatch, LogSink};

/// Upper bound for draining in-flight connections on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const SANDBOX_HOST: &str = "sandbox";
const LOOPBACK_HOST: &str = "127.0.0.1";
const LOGS_PATH: &str = "/";
const EVENT_CHANNEL_CAPACITY: usize = 16;
const ACCEPT_RETRY_MIN: Duration = Duration::from_millis(5);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// Where the listener binds and which host the Logs API should push to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub host: String,
    /// 0 picks a free port
    pub port: u16,
    pub advertised_host: String,
}

impl ListenerConfig {
    /// Address reachable by the Logs API inside a Lambda execution environment.
    #[must_use]
    pub fn sandbox(port: u16) -> Self {
        Self {
            host: SANDBOX_HOST.to_string(),
            port,
            advertised_host: SANDBOX_HOST.to_string(),
        }
    }

    /// Loopback address, used under `sam local` and in tests.
    #[must_use]
    pub fn loopback(port: u16) -> Self {
        Self {
            host: LOOPBACK_HOST.to_string(),
            port,
            advertised_host: LOOPBACK_HOST.to_string(),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        if config.sam_local {
            Self::loopback(config.listener_port)
        } else {
            Self::sandbox(config.listener_port)
        }
    }

    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::sandbox(DEFAULT_LISTENER_PORT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Running(SocketAddr),
}

/// Lifecycle notifications published by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Started(SocketAddr),
    Stopped(SocketAddr),
    /// The accept loop hit an unrecoverable error and the listener stopped itself.
    Failed { addr: SocketAddr, error: String },
}

#[derive(Debug, Default)]
pub struct ListenerStats {
    received_batches: AtomicU64,
    received_bytes: AtomicU64,
    dropped_requests: AtomicU64,
}

impl ListenerStats {
    pub fn received_batches(&self) -> u64 {
        self.received_batches.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    /// Requests whose body could not be read.
    pub fn dropped_requests(&self) -> u64 {
        self.dropped_requests.load(Ordering::Relaxed)
    }
}

/// Source of inbound connections for the accept loop.
#[async_trait]
pub(crate) trait Accept: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<TcpStream>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&self) -> io::Result<TcpStream> {
        TcpListener::accept(self).await.map(|(stream, _)| stream)
    }
}

struct Running {
    addr: SocketAddr,
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    running: Option<Running>,
    generation: u64,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Local HTTP endpoint the Logs API pushes batches to.
pub struct LogsListener {
    config: ListenerConfig,
    sink: Arc<dyn LogSink>,
    stats: Arc<ListenerStats>,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<ListenerEvent>,
}

impl LogsListener {
    #[must_use]
    pub fn new(config: ListenerConfig, sink: Arc<dyn LogSink>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            sink,
            stats: Arc::new(ListenerStats::default()),
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    /// Binds and starts serving on a background task. The listener accepts connections once this
    /// returns.
    pub async fn start(&self) -> Result<SocketAddr, ListenerError> {
        if let Some(running) = &lock(&self.inner).running {
            return Err(ListenerError::AlreadyRunning(running.addr));
        }

        let address = self.config.bind_address();
        let bind_error = |source| ListenerError::Bind {
            address: address.clone(),
            source,
        };
        let tcp_listener = TcpListener::bind(&address).await.map_err(bind_error)?;
        let addr = tcp_listener.local_addr().map_err(bind_error)?;
        self.launch(tcp_listener, addr)
    }

    /// Spawns the serve task on an already bound `acceptor`.
    pub(crate) fn launch<A: Accept>(
        &self,
        acceptor: A,
        addr: SocketAddr,
    ) -> Result<SocketAddr, ListenerError> {
        let mut inner = lock(&self.inner);
        // Another start may have won the race while we were binding.
        if let Some(running) = &inner.running {
            return Err(ListenerError::AlreadyRunning(running.addr));
        }
        inner.generation += 1;
        let generation = inner.generation;
        let cancel = CancellationToken::new();

        let server = Server {
            sink: Arc::clone(&self.sink),
            stats: Arc::clone(&self.stats),
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
            cancel: cancel.clone(),
            generation,
        };
        let handle = tokio::spawn(server.serve(acceptor, addr));

        inner.running = Some(Running {
            addr,
            generation,
            cancel,
            handle,
        });
        drop(inner);

        debug!("Logs listener serving on {addr}");
        let _ = self.events.send(ListenerEvent::Started(addr));
        Ok(addr)
    }

    /// Stops accepting, drains in-flight connections for at most [`SHUTDOWN_TIMEOUT`] and
    /// releases the address. Does nothing when already stopped.
    pub async fn shutdown(&self) {
        let Some(running) = lock(&self.inner).running.take() else {
            return;
        };

        running.cancel.cancel();
        let mut handle = running.handle;
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            warn!("Logs listener did not drain within {SHUTDOWN_TIMEOUT:?}, aborting connections");
            handle.abort();
            let _ = handle.await;
        }

        debug!("Logs listener on {} stopped", running.addr);
        let _ = self.events.send(ListenerEvent::Stopped(running.addr));
    }

    pub fn state(&self) -> ListenerState {
        match &lock(&self.inner).running {
            Some(running) => ListenerState::Running(running.addr),
            None => ListenerState::Stopped,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner).running.as_ref().map(|running| running.addr)
    }

    /// URI to hand to the Logs API for a listener bound on `addr`.
    pub fn destination_uri(&self, addr: SocketAddr) -> String {
        format!("http://{}:{}", self.config.advertised_host, addr.port())
    }

    pub fn events(&self) -> broadcast::Receiver<ListenerEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    pub fn sink(&self) -> &Arc<dyn LogSink> {
        &self.sink
    }
}

impl Drop for LogsListener {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.inner).running.take() {
            running.cancel.cancel();
        }
    }
}

/// State owned by one serve task.
struct Server {
    sink: Arc<dyn LogSink>,
    stats: Arc<ListenerStats>,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<ListenerEvent>,
    cancel: CancellationToken,
    generation: u64,
}

impl Server {
    async fn serve<A: Accept>(self, listener: A, addr: SocketAddr) {
        let builder = hyper::server::conn::http1::Builder::new();
        let mut connections = JoinSet::new();
        let mut retry_delay = Duration::ZERO;

        let result = loop {
            let stream = tokio::select! {
                () = self.cancel.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        retry_delay = Duration::ZERO;
                        stream
                    }
                    Err(e) if is_connection_error(&e) => continue,
                    Err(e) if is_descriptor_exhaustion(&e) => {
                        retry_delay = (retry_delay * 2).clamp(ACCEPT_RETRY_MIN, ACCEPT_RETRY_MAX);
                        warn!("Logs listener accept failed: {e}, retrying in {retry_delay:?}");
                        tokio::select! {
                            () = self.cancel.cancelled() => break Ok(()),
                            () = tokio::time::sleep(retry_delay) => continue,
                        }
                    }
                    Err(e) => break Err(e),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            };

            let io = TokioIo::new(stream);
            let builder = builder.clone();
            let cancel = self.cancel.clone();
            let sink = Arc::clone(&self.sink);
            let stats = Arc::clone(&self.stats);
            let service = service_fn(move |req| {
                handle_logs_request(req, Arc::clone(&sink), Arc::clone(&stats))
            });

            connections.spawn(
                async move {
                    let conn = builder.serve_connection(io, service);
                    tokio::pin!(conn);
                    tokio::select! {
                        _ = conn.as_mut() => {}
                        () = cancel.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            let _ = conn.await;
                        }
                    }
                }
                .with_subscriber(NoSubscriber::default()),
            );
        };

        // Release the address before draining.
        drop(listener);

        if let Err(e) = result {
            error!("Logs listener on {addr} stopped unexpectedly: {e}");
            self.auto_shutdown(addr, e, &mut connections).await;
            return;
        }

        while connections.join_next().await.is_some() {}
    }

    /// Shutdown path taken when the accept loop fails: the listener marks itself stopped unless a
    /// newer run has replaced it, then drains like a regular shutdown.
    async fn auto_shutdown(
        &self,
        addr: SocketAddr,
        error: io::Error,
        connections: &mut JoinSet<()>,
    ) {
        let was_current = {
            let mut inner = lock(&self.inner);
            let current = inner
                .running
                .as_ref()
                .is_some_and(|running| running.generation == self.generation);
            if current {
                inner.running = None;
            }
            current
        };

        self.cancel.cancel();
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            connections.abort_all();
        }

        if was_current {
            let _ = self.events.send(ListenerEvent::Failed {
                addr,
                error: error.to_string(),
            });
        }
    }
}

/// The peer went away between the SYN and the accept; only that connection is lost.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

/// The process or the system ran out of file descriptors. Clears up once connections close.
fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(EMFILE | ENFILE))
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// Reads the whole body and hands it to the sink. Runs with diagnostics disabled.
async fn handle_logs_request(
    req: Request<Incoming>,
    sink: Arc<dyn LogSink>,
    stats: Arc<ListenerStats>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != LOGS_PATH {
        return Ok(empty_response(StatusCode::NOT_FOUND));
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            stats.dropped_requests.fetch_add(1, Ordering::Relaxed);
            return Ok(empty_response(StatusCode::BAD_REQUEST));
        }
    };

    stats.received_batches.fetch_add(1, Ordering::Relaxed);
    stats
        .received_bytes
        .fetch_add(body.len() as u64, Ordering::Relaxed);
    sink.deliver(LogBatch::new(body)).await;

    Ok(empty_response(StatusCode::OK))
}
