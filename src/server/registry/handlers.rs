use axum::{
    body::{Body, Bytes},
    extract::{Extension, State},
    http::{header, HeaderMap, HeaderName, Method, Uri},
    response::Response,
};
use tracing::{info, warn};

use super::resolve;
use crate::server::auth::Credentials;
use crate::server::error::{ServerError, ServerErrorExt};
use crate::server::middleware::RequestId;
use crate::server::oci::{allowed_headers, ProxyRequest, UpstreamResponse};
use crate::server::state::AppState;

/// Connection-scoped headers that must not be relayed from upstream
const HOP_BY_HOP_HEADERS: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(name) || name.as_str() == "keep-alive"
}

/// Forward one `/v2/...` request to the upstream its org alias selects
///
/// The body is buffered so it can be replayed on the authenticated retry.
/// Its size is capped by the `DefaultBodyLimit` layer in [`super::routes`].
pub async fn proxy_registry_request(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let original_path = uri.path().to_string();
    let route = resolve(&state.orgs, &original_path);

    let forward_credentials = state.proxy_settings.forward_client_credentials;
    let credentials = if forward_credentials {
        Credentials::from_headers(&headers)
    } else {
        Credentials::anonymous()
    };

    let request_id = request_id
        .map(|Extension(id)| id.0.to_string())
        .unwrap_or_default();

    info!(
        request_id = %request_id,
        method = %method,
        path = %original_path,
        rewritten_path = %route.path,
        upstream = %route.upstream,
        org = %route.org,
        username = %credentials.username,
        has_credentials = credentials.is_complete(),
        "Proxying registry request"
    );

    let query = if state.proxy_settings.forward_query_string {
        uri.query().map(str::to_string)
    } else {
        None
    };

    let proxy_request = ProxyRequest {
        method: method.clone(),
        path: route.path.clone(),
        query,
        headers: allowed_headers(&headers, forward_credentials),
        body,
    };

    let backend = state.backend_for(&route).with_credentials(credentials);

    let upstream = backend.proxy(&proxy_request).await.map_err(|e| {
        if !e.is_upstream() {
            warn!(
                request_id = %request_id,
                host = %backend.host(),
                "Upstream is misconfigured"
            );
        }
        ServerError::from(e)
            .with_context("request_id", request_id.clone())
            .with_context("upstream", route.upstream.clone())
            .with_context("path", route.path.clone())
    })?;

    info!(
        request_id = %request_id,
        method = %method,
        rewritten_path = %route.path,
        status = upstream.status().as_u16(),
        "Upstream responded"
    );

    into_response(upstream)
}

/// Relay an upstream response: status, end-to-end headers, streamed body
fn into_response(upstream: UpstreamResponse) -> Result<Response, ServerError> {
    let mut builder = Response::builder().status(upstream.status());

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name) {
                headers.append(name.clone(), value.clone());
            }
        }
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .internal_err("Failed to build response")
}
