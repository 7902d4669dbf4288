use super::handlers;
use crate::server::state::AppState;
use axum::{extract::DefaultBodyLimit, routing::any, Router};

/// Registry API surface; every method is forwarded
///
/// Request bodies larger than `max_body_bytes` are refused with 413.
pub fn routes(max_body_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/v2/", any(handlers::proxy_registry_request))
        .route("/v2/{*path}", any(handlers::proxy_registry_request))
        .layer(DefaultBodyLimit::max(max_body_bytes))
}
