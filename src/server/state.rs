use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::server::auth::TokenProvider;
use crate::server::oci::{build_upstream_client, Backend};
use crate::server::registry::{OrgRegistry, ResolvedRoute};
use crate::server::settings::{CacheMode, ProxySettings, ServerSettings, Settings, TokenSettings};

/// State shared by every request handler
#[derive(Clone)]
pub struct AppState {
    pub orgs: Arc<OrgRegistry>,
    /// Client for upstream registry calls, shared so connections are pooled
    pub upstream_client: reqwest::Client,
    /// Process-wide provider; its cache is the shared token cache
    pub token_provider: TokenProvider,
    pub server_settings: Arc<ServerSettings>,
    pub proxy_settings: Arc<ProxySettings>,
    pub token_settings: Arc<TokenSettings>,
}

impl AppState {
    pub fn new(settings: &Settings) -> Result<Self> {
        let upstream_client = build_upstream_client(&settings.proxy)
            .context("Failed to initialize upstream client")?;
        let token_provider = TokenProvider::from_settings(&settings.token)
            .context("Failed to initialize token provider")?;

        let orgs = settings.org_registry();
        for (alias, upstream) in orgs.aliases() {
            tracing::debug!(alias = %alias, upstream = %upstream, "Registered org alias");
        }

        tracing::info!(
            cache_mode = ?settings.token.cache_mode,
            forward_client_credentials = settings.proxy.forward_client_credentials,
            "Initialized registry mirror state"
        );

        Ok(Self {
            orgs: Arc::new(orgs),
            upstream_client,
            token_provider,
            server_settings: Arc::new(settings.server.clone()),
            proxy_settings: Arc::new(settings.proxy.clone()),
            token_settings: Arc::new(settings.token.clone()),
        })
    }

    /// Token provider for one inbound request according to the cache mode
    pub fn token_provider_for_request(&self) -> TokenProvider {
        match self.token_settings.cache_mode {
            CacheMode::Shared => self.token_provider.clone(),
            CacheMode::PerRequest => self
                .token_provider
                .with_fresh_cache(self.token_settings.max_cache_entries),
        }
    }

    /// Backend for the upstream a request resolved to
    pub fn backend_for(&self, route: &ResolvedRoute) -> Backend {
        Backend::new(
            route.upstream.clone(),
            self.upstream_client.clone(),
            Some(self.token_provider_for_request()),
        )
        .with_response_timeout(Duration::from_secs(self.proxy_settings.response_timeout_secs))
    }
}
