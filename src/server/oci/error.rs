use thiserror::Error;

/// Failures while proxying a request to an upstream registry
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The upstream base URL or realm URL could not be turned into a request
    #[error("Invalid upstream configuration: {0}")]
    Configuration(String),

    #[error("Upstream request to {url} failed")]
    UpstreamTransport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Upstream request to {url} timed out after {timeout_secs}s")]
    UpstreamTimeout { url: String, timeout_secs: u64 },

    #[error("Malformed WWW-Authenticate challenge: {0}")]
    MalformedChallenge(String),

    #[error("Token fetch from {realm} failed: {reason}")]
    TokenFetch {
        realm: String,
        reason: String,
        #[source]
        source: Option<reqwest::Error>,
    },
}

impl ProxyError {
    pub(crate) fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::UpstreamTransport {
            url: url.into(),
            source,
        }
    }

    pub(crate) fn token_fetch(realm: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TokenFetch {
            realm: realm.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn token_fetch_with_source(
        realm: impl Into<String>,
        reason: impl Into<String>,
        source: reqwest::Error,
    ) -> Self {
        Self::TokenFetch {
            realm: realm.into(),
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Whether the failure happened talking to a remote host, as opposed to
    /// a problem with local input or configuration
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTransport { .. } | Self::UpstreamTimeout { .. } | Self::TokenFetch { .. }
        )
    }
}
