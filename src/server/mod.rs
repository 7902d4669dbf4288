pub mod auth;
pub mod error;
pub mod middleware;
pub mod oci;
pub mod registry;
pub mod settings;
pub mod state;

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use error::ServerError;
use state::AppState;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use auth::TokenCache;

/// Assemble the mirror's router around `state`
pub fn build_router(state: AppState) -> Router {
    let max_body_bytes =
        usize::try_from(state.proxy_settings.max_body_bytes).unwrap_or(usize::MAX);

    Router::new()
        .route("/", get(root_redirect))
        .route("/health", get(health_check))
        .route("/version", get(version_info))
        .merge(registry::routes::routes(max_body_bytes))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(middleware::request_id_middleware)),
        )
}

/// Run the HTTP server until SIGINT or SIGTERM
pub async fn run_server(settings: settings::Settings) -> Result<()> {
    let state = AppState::new(&settings)?;

    info!(
        interval_secs = settings.token.sweep_interval_secs,
        "Starting token cache sweep"
    );
    let sweep_handle = tokio::spawn(run_cache_sweep_loop(
        state.token_provider.cache().clone(),
        Duration::from_secs(settings.token.sweep_interval_secs),
    ));

    let app = build_router(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("HTTP server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweep_handle.abort();
    let _ = sweep_handle.await;

    info!("HTTP server shutdown complete");
    Ok(())
}

/// Periodically evict expired tokens from the shared cache
async fn run_cache_sweep_loop(cache: TokenCache, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        cache.sweep().await;
        tracing::debug!(entries = cache.entry_count(), "Swept token cache");
    }
}

async fn root_redirect(State(state): State<AppState>) -> Result<Response, ServerError> {
    match &state.server_settings.root_redirect_url {
        Some(url) => Ok((
            StatusCode::MOVED_PERMANENTLY,
            [(header::LOCATION, url.clone())],
        )
            .into_response()),
        None => Err(ServerError::not_found("Not found")),
    }
}

async fn health_check() -> &'static str {
    "OK"
}

async fn version_info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
