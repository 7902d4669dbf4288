use moka::future::Cache;
use moka::Expiry;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

use super::challenge::AuthChallenge;
use super::credentials::Credentials;
use super::token_provider::Token;

/// Upper bound on how long any token is kept, whatever the realm claims
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A fetched token together with the instant it stops being valid
#[derive(Debug, Clone)]
struct CachedToken {
    token: Token,
    deadline: Instant,
}

/// Expires each entry at its own token deadline
struct TokenExpiry;

impl Expiry<String, CachedToken> for TokenExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedToken,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(
            value
                .deadline
                .saturating_duration_since(created_at)
                .min(MAX_TOKEN_TTL),
        )
    }
}

/// Concurrency-safe bearer token cache keyed by [`cache_key`]
///
/// Entries expire after the token's `expires_in`. Moka evicts them lazily and
/// during [`TokenCache::sweep`]; lookups additionally check the stored
/// deadline so an expired token is never handed out.
#[derive(Clone)]
pub struct TokenCache {
    cache: Cache<String, CachedToken>,
}

impl TokenCache {
    /// Create a cache holding at most `max_capacity` tokens
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(TokenExpiry)
            .build();

        Self { cache }
    }

    /// Look up an unexpired token
    pub async fn get(&self, key: &str) -> Option<Token> {
        let entry = self.cache.get(key).await?;
        if Instant::now() >= entry.deadline {
            self.cache.invalidate(key).await;
            return None;
        }
        Some(entry.token)
    }

    /// Store a token for `expires_in` seconds, at most [`MAX_TOKEN_TTL`]
    ///
    /// Tokens with a non-positive lifetime are not stored. Returns whether the
    /// token was cached.
    pub async fn insert(&self, key: String, token: Token) -> bool {
        let Ok(secs) = u64::try_from(token.expires_in) else {
            return false;
        };
        if secs == 0 {
            return false;
        }

        let ttl = Duration::from_secs(secs).min(MAX_TOKEN_TTL);
        let Some(deadline) = Instant::now().checked_add(ttl) else {
            return false;
        };
        self.cache.insert(key, CachedToken { token, deadline }).await;
        true
    }

    /// Run moka's pending maintenance, evicting expired entries
    pub async fn sweep(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// Approximate number of stored entries
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

/// Deterministic cache key for a credentials + challenge tuple
///
/// The tuple is hashed with SHA-256 so credentials are never kept in the
/// clear as map keys.
pub fn cache_key(credentials: &Credentials, challenge: &AuthChallenge) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}:{}/{}/{}/{}",
            credentials.username,
            credentials.password,
            challenge.realm,
            challenge.service,
            challenge.scope
        )
        .as_bytes(),
    );
    format!("token/{:x}", hasher.finalize())
}
