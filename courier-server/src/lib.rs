//! Courier - streaming chat relay with session persistence.
//!
//! Proxies chat requests to an OpenAI-compatible completion endpoint,
//! streams the reply back to the browser token-by-token over SSE, and
//! records sessions and messages in SQLite.
//!
//! ## Architecture
//!
//! ```text
//! Browser → Routes → Relay ──▶ Upstream provider (SSE)
//!                      │
//!                      └──▶ Session Store (SQLite)
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod relay;
pub mod routes;
pub mod store;
pub mod upstream;

pub use relay::{relay, OutboundEvent};
pub use routes::AppState;
pub use store::{Session, SessionStore, StoredMessage};
pub use upstream::{ChatMessage, HttpUpstream, Upstream, UpstreamConfig, UpstreamError};

use axum::Router;
use courier_common::config::Config;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Build the server router backed by a SQLite database at `db_path`.
pub fn build_router(db_path: &Path) -> anyhow::Result<Router> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let store = Arc::new(SessionStore::new(db_path)?);
    let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new()?);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Ok(routes::router(AppState { store, upstream }).layer(cors))
}

/// Start the server.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    let router = build_router(&config.database.path)?;

    tracing::info!("Starting Courier on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
