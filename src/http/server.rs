//! HTTP server adapter.
//!
//! # Responsibilities
//! - Wrap a caller-supplied Axum Router with tracing and request timeouts
//! - Run the accept loop as a single task in the worker tracker
//! - Stop accepting on shutdown, drain in-flight connections until the
//!   deadline, then abort whatever is still open
//!
//! # Design Decisions
//! - Connections are served by hyper-util and owned by a `JoinSet` inside
//!   the serve task, so no connection outlives the worker that accepted it

use axum::http::StatusCode;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::HttpConfig;
use crate::lifecycle::{Deadline, LifecycleContext, Server, ShutdownError, WorkerResult, WorkerTracker};

/// How long the serve task gets to abort its connections after a forced close.
const FORCE_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Pause after a failed accept, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum ListenerSource {
    /// Bind inside the serve task; a bind failure is a worker failure.
    Address(String),
    /// Already bound by the caller.
    Bound(std::net::TcpListener),
}

/// [`Server`] implementation serving an Axum router over TCP.
pub struct HttpServer<T: WorkerTracker> {
    ctx: LifecycleContext,
    tracker: T,
    router: Option<Router>,
    source: Option<ListenerSource>,
    local_addr: Option<SocketAddr>,
    request_timeout: Duration,
    /// Begins graceful draining. Child of the lifecycle context.
    graceful: CancellationToken,
    /// Aborts every connection still open.
    force: CancellationToken,
    /// Cancelled by the serve task when it exits, however it exits.
    stopped: CancellationToken,
}

impl<T: WorkerTracker> HttpServer<T> {
    /// Serve `router` on `bind_address`, binding when the server starts.
    pub fn bind(ctx: LifecycleContext, tracker: T, bind_address: impl Into<String>, router: Router) -> Self {
        Self::with_source(ctx, tracker, ListenerSource::Address(bind_address.into()), None, router)
    }

    /// Serve `router` on a listener the caller has already bound.
    pub fn from_listener(
        ctx: LifecycleContext,
        tracker: T,
        listener: std::net::TcpListener,
        router: Router,
    ) -> std::io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        Ok(Self::with_source(
            ctx,
            tracker,
            ListenerSource::Bound(listener),
            Some(local_addr),
            router,
        ))
    }

    /// Build from the `[listener]` and `[http]` config sections.
    pub fn from_config(ctx: LifecycleContext, tracker: T, bind_address: &str, http: &HttpConfig, router: Router) -> Self {
        Self::bind(ctx, tracker, bind_address, router)
            .with_request_timeout(Duration::from_secs(http.request_timeout_secs))
    }

    fn with_source(
        ctx: LifecycleContext,
        tracker: T,
        source: ListenerSource,
        local_addr: Option<SocketAddr>,
        router: Router,
    ) -> Self {
        let graceful = ctx.child_token();
        Self {
            ctx,
            tracker,
            router: Some(router),
            source: Some(source),
            local_addr,
            request_timeout: Duration::from_secs(30),
            graceful,
            force: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    /// Per-request timeout applied to every route.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Address of a pre-bound listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Wrap the router with the standard middleware stack.
    fn build_router(router: Router, request_timeout: Duration) -> Router {
        router.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout)),
        )
    }
}

impl<T: WorkerTracker> Server for HttpServer<T> {
    fn start(&mut self) {
        let (Some(router), Some(source)) = (self.router.take(), self.source.take()) else {
            tracing::warn!("HTTP server already started");
            return;
        };

        let app = Self::build_router(router, self.request_timeout);
        self.tracker.spawn(serve(
            source,
            app,
            self.graceful.clone(),
            self.force.clone(),
            self.stopped.clone(),
        ));
    }

    async fn shutdown(&mut self, deadline: Deadline) -> Result<(), ShutdownError> {
        if self.source.is_some() {
            // Never started, nothing to stop.
            return Ok(());
        }

        self.graceful.cancel();
        tokio::select! {
            _ = self.stopped.cancelled() => {
                tracing::info!("HTTP server drained");
                Ok(())
            }
            _ = deadline.expired() => {
                tracing::warn!(timeout = ?deadline.timeout(), "HTTP server drain timed out, force-closing");
                self.force.cancel();
                if tokio::time::timeout(FORCE_CLOSE_GRACE, self.stopped.cancelled()).await.is_err() {
                    tracing::error!("HTTP serve loop did not stop after force-close");
                }
                Err(ShutdownError::DeadlineExceeded {
                    timeout: deadline.timeout(),
                })
            }
        }
    }
}

/// The accept loop. A graceful or forced close ends it successfully; only
/// a bind failure is a worker failure.
async fn serve(
    source: ListenerSource,
    app: Router,
    graceful: CancellationToken,
    force: CancellationToken,
    stopped: CancellationToken,
) -> WorkerResult {
    let _stopped = stopped.drop_guard();

    let listener = match source {
        ListenerSource::Address(address) => TcpListener::bind(address.as_str()).await?,
        ListenerSource::Bound(listener) => TcpListener::from_std(listener)?,
    };
    let address = listener.local_addr()?;
    tracing::info!(address = %address, "HTTP server starting");

    let builder = Builder::new(TokioExecutor::new());
    let watcher = GracefulShutdown::new();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let service = TowerToHyperService::new(app.clone());
                let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                let conn = watcher.watch(conn.into_owned());
                connections.spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!(remote = %remote, error = %e, "Connection ended with error");
                    }
                });
            }
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "Connection task failed");
                }
            }
            _ = graceful.cancelled() => break,
        }
    }

    drop(listener);
    tracing::info!(address = %address, open = connections.len(), "HTTP server draining connections");

    let forced = tokio::select! {
        _ = drain(watcher, &mut connections) => false,
        _ = force.cancelled() => true,
    };
    if forced {
        tracing::warn!(address = %address, open = connections.len(), "HTTP server force-closed, aborting connections");
        connections.shutdown().await;
    }

    tracing::info!(address = %address, "HTTP server stopped");
    Ok(())
}

/// Ask every connection to finish its current request, then reap them all.
async fn drain(watcher: GracefulShutdown, connections: &mut JoinSet<()>) {
    watcher.shutdown().await;
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "Connection task failed");
        }
    }
}
