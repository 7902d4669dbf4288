mod backend;
mod error;

pub use backend::{
    allowed_headers, build_upstream_client, Backend, ProxyRequest, UpstreamResponse,
};
pub use error::ProxyError;
