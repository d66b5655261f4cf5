//! Mock server lifecycle: bind, serve, stop.
//!
//! A [`MockServer`] owns its stub registry and request journal, so several
//! servers in one process never see each other's stubs.

use crate::config::{
    GlobalSettings, MockServerConfig, RequestMatcher, ResponseDefinition, StubDefinition,
};
use crate::error::{MockServerError, Result};
use crate::handler::{handle_request, ServerState};
use crate::journal::{RecordedRequest, RequestJournal};
use crate::matcher::CompiledMatcher;
use crate::registry::StubRegistry;
use crate::template::TemplateEngine;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// A stub-driven HTTP mock server.
pub struct MockServer {
    state: Arc<ServerState>,
    running: Mutex<Option<RunningServer>>,
}

struct RunningServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Create a stopped server with no stubs.
    pub fn new(settings: GlobalSettings) -> Self {
        Self::with_default_response(settings, None)
    }

    fn with_default_response(
        settings: GlobalSettings,
        default_response: Option<ResponseDefinition>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                registry: StubRegistry::new(),
                journal: RequestJournal::new(),
                templates: TemplateEngine::new(),
                settings,
                default_response,
            }),
            running: Mutex::new(None),
        }
    }

    /// Create a stopped server and register every stub of `config` in order.
    pub fn from_config(config: MockServerConfig) -> Result<Self> {
        config.validate()?;
        let server = Self::with_default_response(config.settings, config.default_response);
        for stub in config.stubs {
            server.register(stub)?;
        }
        info!(stubs = server.stub_count(), "Mock server configured");
        Ok(server)
    }

    /// Bind the listener, start accepting connections and return the base
    /// URL. Returns only once the accept loop is live. Calling `start` on a
    /// running server returns its current URL.
    pub async fn start(&self) -> Result<String> {
        if let Some(url) = self.base_url() {
            return Ok(url);
        }

        let settings = &self.state.settings;
        let bind = format!("{}:{}", settings.host, settings.port);
        let listener = TcpListener::bind(bind.as_str())
            .await
            .map_err(|source| MockServerError::Bind {
                addr: bind.clone(),
                source,
            })?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let grace = Duration::from_millis(settings.grace_period_ms);
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(accept_loop(listener, state, shutdown_rx, ready_tx, grace));
        if ready_rx.await.is_err() {
            task.abort();
            return Err(MockServerError::Io(std::io::Error::other(
                "accept loop exited before becoming ready",
            )));
        }

        let url = format!("http://{}", addr);
        info!(url = %url, "Mock server started");

        let mut running = self.running.lock();
        if let Some(existing) = running.as_ref() {
            // Lost a race with a concurrent start; keep the first server.
            let _ = shutdown_tx.send(());
            return Ok(format!("http://{}", existing.addr));
        }
        *running = Some(RunningServer {
            addr,
            shutdown_tx,
            task,
        });
        Ok(url)
    }

    /// Stop accepting connections, let in-flight requests finish within the
    /// grace period, then release the port. No-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            debug!("Stop requested but mock server is not running");
            return;
        };

        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.task.await {
            error!(error = %e, "Mock server accept loop panicked");
        }
        info!(addr = %running.addr, "Mock server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// `http://host:port` of the running server.
    pub fn base_url(&self) -> Option<String> {
        self.address().map(|addr| format!("http://{}", addr))
    }

    /// Socket address of the running server.
    pub fn address(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }

    /// Absolute URL for `path` on the running server.
    pub fn url(&self, path: &str) -> Option<String> {
        self.base_url().map(|base| format!("{}{}", base, path))
    }

    /// Register a stub. Invalid stubs are rejected immediately.
    pub fn register(&self, stub: StubDefinition) -> Result<u64> {
        self.state.registry.register(stub)
    }

    /// Discard all stubs and the request journal.
    ///
    /// Call between scenarios, with no requests in flight.
    pub fn reset(&self) {
        self.state.registry.reset();
        self.state.journal.clear();
    }

    pub fn stub_count(&self) -> usize {
        self.state.registry.len()
    }

    /// Number of received requests satisfying `pattern`.
    pub fn received_count(&self, pattern: &RequestMatcher) -> Result<usize> {
        let matcher = CompiledMatcher::compile(pattern)?;
        Ok(self.state.journal.count_matching(&matcher))
    }

    /// Whether at least one received request satisfies `pattern`.
    pub fn was_received(&self, pattern: &RequestMatcher) -> Result<bool> {
        Ok(self.received_count(pattern)? > 0)
    }

    /// Every request received since start or the last reset.
    pub fn received_requests(&self) -> Vec<RecordedRequest> {
        self.state.journal.entries()
    }
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new(GlobalSettings::default())
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown_tx.send(());
        }
    }
}

/// Accept connections until shutdown, then drain them.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: oneshot::Receiver<()>,
    ready_tx: oneshot::Sender<()>,
    grace: Duration,
) {
    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();
    let _ = ready_tx.send(());

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                let state = Arc::clone(&state);
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { handle_request(req, state, peer).await }
                });
                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                let conn = graceful.watch(conn);

                connections.spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(peer = %peer, error = %e, "Connection closed with error");
                    }
                });
            }

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            _ = &mut shutdown_rx => {
                debug!("Shutdown signal received, no longer accepting connections");
                break;
            }
        }
    }

    drop(listener);
    if tokio::time::timeout(grace, graceful.shutdown()).await.is_err() {
        warn!(
            grace_ms = grace.as_millis() as u64,
            open = connections.len(),
            "Grace period elapsed, closing remaining connections"
        );
    }
    connections.shutdown().await;
}
