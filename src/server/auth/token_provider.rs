use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::challenge::AuthChallenge;
use super::credentials::Credentials;
use super::token_storage::{cache_key, TokenCache};
use crate::server::oci::ProxyError;
use crate::server::settings::TokenSettings;

/// Bearer token issued by a registry's token realm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub token: String,
    /// Lifetime in seconds; zero or less means the token is not cached
    pub expires_in: i64,
}

/// Body returned by a token realm
///
/// Docker-style realms return `token`, OAuth2-style ones `access_token`, and
/// several return both. `expires_in` is optional in practice (ghcr.io omits it).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: i64,
}

/// Answers bearer challenges by fetching tokens from the challenge realm
///
/// Tokens are cached per credentials + challenge tuple. Cloning is cheap and
/// clones share the same cache.
#[derive(Clone)]
pub struct TokenProvider {
    http_client: reqwest::Client,
    cache: TokenCache,
    send_basic_auth: bool,
}

impl TokenProvider {
    pub fn new(http_client: reqwest::Client, cache: TokenCache, send_basic_auth: bool) -> Self {
        Self {
            http_client,
            cache,
            send_basic_auth,
        }
    }

    /// Build a provider with its own realm client and an empty cache
    pub fn from_settings(settings: &TokenSettings) -> Result<Self, ProxyError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.fetch_timeout_secs))
            .build()
            .map_err(|e| {
                ProxyError::Configuration(format!("failed to build token client: {}", e))
            })?;

        Ok(Self::new(
            http_client,
            TokenCache::new(settings.max_cache_entries),
            settings.send_basic_auth,
        ))
    }

    /// The cache backing this provider
    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// A provider sharing this one's realm client but with an empty cache
    pub fn with_fresh_cache(&self, max_capacity: u64) -> Self {
        Self::new(
            self.http_client.clone(),
            TokenCache::new(max_capacity),
            self.send_basic_auth,
        )
    }

    /// Get a token for a raw `WWW-Authenticate` header value
    pub async fn get_token(
        &self,
        authenticate: &str,
        credentials: &Credentials,
    ) -> Result<Token, ProxyError> {
        let challenge = AuthChallenge::parse(authenticate)?;
        self.get_token_for_challenge(&challenge, credentials).await
    }

    /// Get a token for an already parsed challenge, consulting the cache first
    pub async fn get_token_for_challenge(
        &self,
        challenge: &AuthChallenge,
        credentials: &Credentials,
    ) -> Result<Token, ProxyError> {
        let key = cache_key(credentials, challenge);

        if let Some(token) = self.cache.get(&key).await {
            debug!(cache_key = %key, "Using cached token");
            return Ok(token);
        }

        let token = self.fetch_token(challenge, credentials).await?;

        if self.cache.insert(key.clone(), token.clone()).await {
            info!(cache_key = %key, expires_in = token.expires_in, "Cached new token");
        } else {
            debug!(
                cache_key = %key,
                expires_in = token.expires_in,
                "Token has no positive lifetime, not caching"
            );
        }

        Ok(token)
    }

    /// Request a fresh token from the challenge realm
    async fn fetch_token(
        &self,
        challenge: &AuthChallenge,
        credentials: &Credentials,
    ) -> Result<Token, ProxyError> {
        let url = token_url(challenge)?;

        let mut request = self.http_client.get(url.clone());
        if self.send_basic_auth && credentials.is_complete() {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        debug!(url = %url, "Fetching token");

        let response = request.send().await.map_err(|e| {
            ProxyError::token_fetch_with_source(&challenge.realm, "request failed", e)
        })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ProxyError::token_fetch(
                &challenge.realm,
                format!("token request failed with status {}", status.as_u16()),
            ));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            ProxyError::token_fetch_with_source(&challenge.realm, "failed to decode token response", e)
        })?;

        let token = body
            .token
            .filter(|t| !t.is_empty())
            .or(body.access_token.filter(|t| !t.is_empty()))
            .ok_or_else(|| {
                ProxyError::token_fetch(&challenge.realm, "token response contained no token")
            })?;

        Ok(Token {
            token,
            expires_in: body.expires_in,
        })
    }
}

/// Realm URL with `service` and `scope` appended when non-empty
fn token_url(challenge: &AuthChallenge) -> Result<Url, ProxyError> {
    let mut url = Url::parse(&challenge.realm).map_err(|e| {
        ProxyError::token_fetch(&challenge.realm, format!("invalid realm URL: {}", e))
    })?;

    {
        let mut query = url.query_pairs_mut();
        if !challenge.service.is_empty() {
            query.append_pair("service", &challenge.service);
        }
        if !challenge.scope.is_empty() {
            query.append_pair("scope", &challenge.scope);
        }
    }

    // query_pairs_mut leaves a dangling '?' when nothing was appended
    if url.query() == Some("") {
        url.set_query(None);
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CHALLENGE: &str = r#"Bearer realm="REALM/token",service="registry.example.com",scope="repository:foo/bar:pull""#;

    fn challenge_for(server: &MockServer) -> String {
        CHALLENGE.replace("REALM", &server.uri())
    }

    fn provider(send_basic_auth: bool) -> TokenProvider {
        TokenProvider::new(reqwest::Client::new(), TokenCache::new(100), send_basic_auth)
    }

    #[test]
    fn test_token_url_appends_query() {
        let challenge = AuthChallenge {
            realm: "https://auth.example.com/token".to_string(),
            service: "registry.example.com".to_string(),
            scope: "repository:foo/bar:pull".to_string(),
        };
        let url = token_url(&challenge).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("service".to_string(), "registry.example.com".to_string()),
                ("scope".to_string(), "repository:foo/bar:pull".to_string()),
            ]
        );
        assert_eq!(url.path(), "/token");
    }

    #[test]
    fn test_token_url_omits_empty_parameters() {
        let challenge = AuthChallenge {
            realm: "https://ghcr.io/token".to_string(),
            ..Default::default()
        };
        let url = token_url(&challenge).unwrap();
        assert_eq!(url.as_str(), "https://ghcr.io/token");
    }

    #[test]
    fn test_token_url_keeps_existing_realm_query() {
        let challenge = AuthChallenge {
            realm: "https://auth.example.com/token?client_id=mirror".to_string(),
            scope: "repository:foo:pull".to_string(),
            ..Default::default()
        };
        let url = token_url(&challenge).unwrap();
        assert_eq!(
            url.query(),
            Some("client_id=mirror&scope=repository%3Afoo%3Apull")
        );
    }

    #[test]
    fn test_token_url_requires_realm() {
        let result = token_url(&AuthChallenge::default());
        assert!(matches!(result, Err(ProxyError::TokenFetch { .. })));
    }

    #[tokio::test]
    async fn test_fetches_token_with_service_and_scope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("service", "registry.example.com"))
            .and(query_param("scope", "repository:foo/bar:pull"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "abc", "expires_in": 300})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let token = provider(false)
            .get_token(&challenge_for(&server), &Credentials::anonymous())
            .await
            .unwrap();

        assert_eq!(
            token,
            Token {
                token: "abc".to_string(),
                expires_in: 300
            }
        );
    }

    #[tokio::test]
    async fn test_cache_hit_skips_second_fetch_until_ttl_elapses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "abc", "expires_in": 1})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider(false);
        let creds = Credentials::new("alice", "s3cret");
        let challenge = challenge_for(&server);

        provider.get_token(&challenge, &creds).await.unwrap();
        provider.get_token(&challenge, &creds).await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        provider.get_token(&challenge, &creds).await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_different_credentials_fetch_separately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "abc", "expires_in": 300})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider(false);
        let challenge = challenge_for(&server);

        provider
            .get_token(&challenge, &Credentials::new("alice", "a"))
            .await
            .unwrap();
        provider
            .get_token(&challenge, &Credentials::new("bob", "b"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_huge_lifetime_is_usable_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "abc", "expires_in": i64::MAX})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(false);
        let challenge = challenge_for(&server);
        let creds = Credentials::anonymous();

        let token = provider.get_token(&challenge, &creds).await.unwrap();
        assert_eq!(token.token, "abc");
        let token = provider.get_token(&challenge, &creds).await.unwrap();
        assert_eq!(token.token, "abc");
    }

    #[tokio::test]
    async fn test_zero_lifetime_is_fetched_every_time() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "abc", "expires_in": 0})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider(false);
        let challenge = challenge_for(&server);
        let creds = Credentials::anonymous();

        provider.get_token(&challenge, &creds).await.unwrap();
        provider.get_token(&challenge, &creds).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_expires_in_and_access_token_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "oauth-style"})),
            )
            .mount(&server)
            .await;

        let token = provider(false)
            .get_token(&challenge_for(&server), &Credentials::anonymous())
            .await
            .unwrap();

        assert_eq!(token.token, "oauth-style");
        assert_eq!(token.expires_in, 0);
    }

    #[tokio::test]
    async fn test_token_preferred_over_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "docker-style",
                "access_token": "oauth-style",
                "expires_in": 60
            })))
            .mount(&server)
            .await;

        let token = provider(false)
            .get_token(&challenge_for(&server), &Credentials::anonymous())
            .await
            .unwrap();
        assert_eq!(token.token, "docker-style");
    }

    #[tokio::test]
    async fn test_non_200_is_token_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let result = provider(false)
            .get_token(&challenge_for(&server), &Credentials::anonymous())
            .await;

        match result {
            Err(ProxyError::TokenFetch { reason, .. }) => assert!(reason.contains("403")),
            other => panic!("expected TokenFetch error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_body_is_token_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let result = provider(false)
            .get_token(&challenge_for(&server), &Credentials::anonymous())
            .await;
        assert!(matches!(result, Err(ProxyError::TokenFetch { .. })));
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider(false);
        let challenge = challenge_for(&server);
        assert!(provider
            .get_token(&challenge, &Credentials::anonymous())
            .await
            .is_err());
        assert!(provider
            .get_token(&challenge, &Credentials::anonymous())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_malformed_challenge_fails_without_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let result = provider(false)
            .get_token(r#"Basic realm="registry""#, &Credentials::anonymous())
            .await;
        assert!(matches!(result, Err(ProxyError::MalformedChallenge(_))));
    }

    #[tokio::test]
    async fn test_credentials_not_sent_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "abc", "expires_in": 60})),
            )
            .mount(&server)
            .await;

        provider(false)
            .get_token(&challenge_for(&server), &Credentials::new("alice", "s3cret"))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn test_basic_auth_sent_when_enabled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(header_exists("authorization"))
            // "alice:s3cret"
            .and(header("authorization", "Basic YWxpY2U6czNjcmV0"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "abc", "expires_in": 60})),
            )
            .expect(1)
            .mount(&server)
            .await;

        provider(true)
            .get_token(&challenge_for(&server), &Credentials::new("alice", "s3cret"))
            .await
            .unwrap();
    }
}
