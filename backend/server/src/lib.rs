//! Upvote and popularity-ranking backend for the site theme's widgets.
//!
//! The theme is a static site. Its pages ask this service how many visitors liked them,
//! let a visitor toggle their own vote and show a list of the most liked pages.
//!
//!
//!
//! # General Infrastructure
//! - Any number of stateless server replicas sit behind the site's reverse proxy
//! - Every replica talks to the same Redis, the only place state crossing requests lives
//! - Visitors are recognised by a signed cookie, there is no server side session
//! - The popular list is refreshed by a timer in each replica or by an external cron running `backend refresh`
//!
//!
//!
//! # Endpoints
//!
//! | Method | Path | Input | Output |
//! |---|---|---|---|
//! | GET | /api/upvote-info | query `slug` | `{slug, upvote_count, upvoted}` |
//! | POST | /api/upvote | form, JSON or query `slug`, optional `request_id` | `{slug, upvote_count, upvoted}` |
//! | GET | /api/popular | query `limit` | `{generated_at, items: [{slug, count}]}` |
//! | GET | /healthz | | `ok` |
//!
//! Errors are always `{"error": "..."}`.
//!
//! - **400**: missing or malformed slug, limit or body
//! - **429**: the visitor toggles faster than `UPVOTE_MIN_INTERVAL_MS`
//! - **503**: the store is unreachable on a write, retry later
//!
//! Reads never fail because of the store. Counts read as zero and the popular list
//! stays at its last good snapshot.
//!
//!
//!
//! # Preventing Double Votes
//!
//! - Each visitor gets one HMAC signed cookie with a random nonce, valid for 180 days
//! - Toggling refreshes the cookie, reading only sets it when missing
//! - A vote is a flag per (page, visitor), flipping it moves the page counter by one in the same atomic step
//! - Clients may send a `request_id`, retrying with the same id never flips twice
//! - Rotating `UPVOTE_COOKIE_SECRET` forgets every visitor, everyone can vote again
//!
//!
//!
//! # Setup
//!
//! Run against a local Redis.
//! ```sh
//! REDIS_URL=redis://127.0.0.1:6379 RUST_LOG=info cargo run -p backend
//! ```
//!
//! Run without Redis.
//! ```sh
//! UPVOTE_STORE=memory RUST_LOG=info cargo run -p backend
//! ```
//!
//! Refresh the popular list once, for cron.
//! ```sh
//! cargo run -p backend -- refresh
//! ```
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

pub mod config;
pub mod database;
pub mod error;
pub mod identity;
pub mod memory;
pub mod ranking;
pub mod routes;
pub mod service;
pub mod state;
pub mod store;
pub mod utils;

use config::Config;
use ranking::RankingSnapshot;
use routes::{health_handler, info_handler, not_found_handler, popular_handler, toggle_handler};
use state::AppState;

pub fn init_tracing() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/api/upvote-info", get(info_handler))
        .route("/api/upvote", post(toggle_handler))
        .route("/api/popular", get(popular_handler))
        .route("/healthz", get(health_handler))
        .fallback(not_found_handler)
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(config: Config) -> Result<()> {
    info!("Initializing state...");
    let state = AppState::new(config).await?;

    let refresher = if state.config.refresh_interval.is_zero() {
        info!("In-process refresh disabled, expecting an external scheduler");
        None
    } else {
        info!(
            "Refreshing popular pages every {:?}",
            state.config.refresh_interval
        );
        Some(
            state
                .ranking
                .clone()
                .spawn_refresher(state.config.refresh_interval),
        )
    };

    info!("Starting server...");

    let app = router(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    if let Some(refresher) = refresher {
        refresher.abort();
    }

    info!("Server shut down");

    Ok(())
}

/// One refresh cycle, for an external cron.
pub async fn refresh_once(config: Config) -> Result<RankingSnapshot> {
    let state = AppState::new(config).await?;

    let snapshot = state
        .ranking
        .refresh()
        .await
        .context("refreshing popular pages")?;

    Ok(snapshot)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
