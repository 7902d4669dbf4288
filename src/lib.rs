//! Pull-through mirror for container registries
//!
//! Requests to `/v2/<org>/...` are routed to the upstream registry selected
//! by the org alias, with the path rewritten to the upstream's conventions.
//! Bearer-token challenges from the upstream are answered transparently.

pub mod server;
