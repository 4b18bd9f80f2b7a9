//! Browser control panel served over HTTP.

mod error;
mod handlers;
mod session;

use crate::config::PanelConfig;
use anyhow::{Context, Result};
use axum::{
    routing::{get, post, put},
    Router,
};
use session::SessionStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// How long shutdown waits for cancelled experiments to exit.
const SHUTDOWN_RUN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub(crate) struct AppState {
    pub panel: Arc<PanelConfig>,
    pub sessions: Arc<SessionStore>,
    /// Flips to true once the server starts shutting down; open event streams watch it.
    pub shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(panel: PanelConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            panel: Arc::new(panel),
            sessions: Arc::new(SessionStore::default()),
            shutdown: Arc::new(shutdown),
        }
    }

    /// End open event streams and cancel every running experiment.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
        let cancelled = self.sessions.cancel_all();
        if cancelled > 0 {
            info!(cancelled, "cancelling running experiments");
        }
    }
}

pub(crate) fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/api/options", get(handlers::options))
        // Sessions and their runs
        .route("/api/sessions", post(handlers::create_session))
        .route("/api/sessions/{id}", get(handlers::get_session))
        .route("/api/sessions/{id}/keys", put(handlers::put_keys))
        .route("/api/sessions/{id}/runs", post(handlers::launch_run))
        .route(
            "/api/sessions/{id}/runs/current/events",
            get(handlers::run_events),
        )
        .route(
            "/api/sessions/{id}/runs/current/cancel",
            post(handlers::cancel_run),
        )
        // Results browser
        .route("/api/results", get(handlers::list_results))
        .route("/api/results/{task}/{file}", get(handlers::get_result))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the panel until Ctrl+C or SIGTERM.
pub(crate) async fn serve(addr: SocketAddr, panel: PanelConfig) -> Result<()> {
    let output_root = panel.output_root.clone();
    let state = AppState::new(panel);
    let router = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("Chameleon panel listening on http://{}", addr);
    info!(output_root = %output_root.display(), "browsing results");

    let on_signal = state.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            on_signal.begin_shutdown();
            tokio::spawn(exit_on_second_interrupt());
        })
        .await
        .context("http server failed")?;

    if !state.sessions.wait_idle(SHUTDOWN_RUN_GRACE).await {
        tracing::warn!("experiments still running at shutdown");
    }
    Ok(())
}

async fn exit_on_second_interrupt() {
    if signal::ctrl_c().await.is_ok() {
        tracing::warn!("second interrupt, exiting immediately");
        std::process::exit(130);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
