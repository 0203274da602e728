//! # Echotrap API
//!
//! The HTTP capture and response engine plus the live fan-out: one axum
//! router serving the dashboard-control REST surface, the WebSocket
//! endpoints and the catch-all that answers (and records) everything
//! addressed at a capture subdomain.
//!
//! The gateway owns its accept loop (see `conn`) so captures can record
//! header names exactly as received, and every long-lived session observes
//! the process shutdown token.

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use echotrap_auth::TokenAuthority;
use echotrap_core::geo::GeoTable;
use echotrap_core::EchotrapConfig;
use echotrap_store::SessionStore;

mod catch_all;
mod conn;
mod rest;
mod ws;

pub use rest::ApiError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EchotrapConfig>,
    pub sessions: SessionStore,
    pub tokens: TokenAuthority,
    pub geo: Arc<GeoTable>,
    /// Process shutdown. Long-lived sessions multiplex on it so teardown
    /// does not wait for the remote peer.
    pub shutdown: CancellationToken,
}

/// The public HTTP component: REST surface, WebSocket fan-out and the
/// subdomain catch-all on one port.
pub struct HttpGateway {
    state: AppState,
}

impl HttpGateway {
    pub fn new(
        config: Arc<EchotrapConfig>,
        sessions: SessionStore,
        geo: Arc<GeoTable>,
        shutdown: CancellationToken,
    ) -> Self {
        let tokens = TokenAuthority::new(config.clone());
        Self {
            state: AppState {
                config,
                sessions,
                tokens,
                geo,
                shutdown,
            },
        }
    }

    /// The assembled router. Split out so tests can drive it directly.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/get_token", post(rest::get_token))
            .route("/api/get_file", get(rest::get_file))
            .route("/api/update_file", post(rest::update_file))
            .route("/api/files", get(rest::get_files).post(rest::update_files))
            .route("/api/get_dns", get(rest::get_dns))
            .route("/api/update_dns", post(rest::update_dns))
            .route("/api/requests", get(rest::list_requests))
            .route("/api/get_request", get(rest::get_request))
            .route("/api/delete_request", post(rest::delete_request))
            .route("/api/delete_all", post(rest::delete_all))
            .route("/api/ws", get(ws::ws_legacy))
            .route("/api/ws2", get(ws::ws_multi))
            .fallback(catch_all::catch_all)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the public port and serve until shutdown.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.state.config.http_port)).await?;
        info!(port = self.state.config.http_port, "http gateway listening");
        self.serve_listener(listener).await
    }

    /// Serve an already-bound listener until shutdown. Each connection runs
    /// through the head-recording serve path in `conn`.
    pub async fn serve_listener(&self, listener: TcpListener) -> anyhow::Result<()> {
        let router = self.router();
        let shutdown = self.state.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(conn::serve_connection(
                            router.clone(),
                            stream,
                            peer,
                            shutdown.clone(),
                        ));
                    }
                    Err(err) => warn!(%err, "accept failed"),
                },
            }
        }

        info!("http gateway stopped");
        Ok(())
    }
}
