use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::ProxyError;
use crate::server::auth::{AuthChallenge, Credentials, TokenProvider};
use crate::server::settings::ProxySettings;

/// Response from the upstream registry, body not yet consumed
pub type UpstreamResponse = reqwest::Response;

/// Inbound headers that may be forwarded upstream, besides `Authorization`
const PROXY_HEADER_ALLOW_LIST: &[HeaderName] = &[
    header::ACCEPT,
    header::USER_AGENT,
    header::ACCEPT_ENCODING,
];

/// One request to forward, already rewritten for its upstream
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Rewritten path, e.g. `/v2/library/nginx/manifests/latest`
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: Option<String>,
    /// Headers to send, already filtered with [`allowed_headers`]
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Copy only the allow-listed headers from an inbound request
///
/// `Authorization` is included only when `include_authorization` is set.
/// Every value of a repeated header is kept.
pub fn allowed_headers(inbound: &HeaderMap, include_authorization: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let mut copy = |name: &HeaderName| {
        for value in inbound.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    };

    for name in PROXY_HEADER_ALLOW_LIST {
        copy(name);
    }
    if include_authorization {
        copy(&header::AUTHORIZATION);
    }

    headers
}

/// Build the shared client used for upstream registry calls
///
/// Only the connect phase and individual body reads are bounded here, so long
/// blob downloads are not cut off. The wait for response headers is bounded
/// per request in [`Backend`].
pub fn build_upstream_client(settings: &ProxySettings) -> Result<reqwest::Client, ProxyError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
        .read_timeout(Duration::from_secs(settings.read_timeout_secs))
        .build()
        .map_err(|e| ProxyError::Configuration(format!("failed to build upstream client: {}", e)))
}

/// Forwards requests to one upstream registry and answers its bearer challenges
///
/// A request is sent at most twice: once as received and, if the upstream
/// answers 401 with a parseable `WWW-Authenticate` challenge, once more with
/// a bearer token. Whatever the second attempt returns is final.
pub struct Backend {
    host: String,
    client: reqwest::Client,
    token_provider: Option<TokenProvider>,
    credentials: Credentials,
    response_timeout: Duration,
}

impl Backend {
    pub fn new(
        host: impl Into<String>,
        client: reqwest::Client,
        token_provider: Option<TokenProvider>,
    ) -> Self {
        Self {
            host: host.into(),
            client,
            token_provider,
            credentials: Credentials::anonymous(),
            response_timeout: Duration::from_secs(300),
        }
    }

    /// Credentials used to key token lookups
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Bound on the wait for each upstream response's headers
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Forward `request` upstream, authenticating once if challenged
    pub async fn proxy(&self, request: &ProxyRequest) -> Result<UpstreamResponse, ProxyError> {
        let url = self.target_url(&request.path, request.query.as_deref())?;

        let response = self.send(request, &url, None).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(token_provider) = &self.token_provider else {
            return Ok(response);
        };

        let Some(authenticate) = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            debug!(url = %url, "401 without challenge, returning as is");
            return Ok(response);
        };

        // Parse before releasing the 401 so a bad challenge still lets the
        // caller see the original response.
        let challenge = match AuthChallenge::parse(&authenticate) {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!(url = %url, error = %e, "Ignoring unusable challenge");
                return Ok(response);
            }
        };

        drop(response);

        info!(
            host = %self.host(),
            authenticate = %authenticate,
            "Handling authentication"
        );

        let token = token_provider
            .get_token_for_challenge(&challenge, &self.credentials)
            .await?;

        self.send(request, &url, Some(&token.token)).await
    }

    fn target_url(&self, path: &str, query: Option<&str>) -> Result<Url, ProxyError> {
        let mut url = Url::parse(&self.host).map_err(|e| {
            ProxyError::Configuration(format!("failed to parse host URL '{}': {}", self.host, e))
        })?;

        if url.cannot_be_a_base() {
            return Err(ProxyError::Configuration(format!(
                "host URL '{}' cannot carry a path",
                self.host
            )));
        }

        url.set_path(path);
        url.set_query(query.filter(|q| !q.is_empty()));
        Ok(url)
    }

    async fn send(
        &self,
        request: &ProxyRequest,
        url: &Url,
        bearer: Option<&str>,
    ) -> Result<UpstreamResponse, ProxyError> {
        let mut headers = request.headers.clone();
        if let Some(token) = bearer {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                ProxyError::token_fetch(url.as_str(), "token is not a valid header value")
            })?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), url.clone())
            .headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        match tokio::time::timeout(self.response_timeout, builder.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ProxyError::transport(url.as_str(), e)),
            Err(_) => Err(ProxyError::UpstreamTimeout {
                url: url.to_string(),
                timeout_secs: self.response_timeout.as_secs(),
            }),
        }
    }
}
