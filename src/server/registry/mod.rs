pub mod handlers;
pub mod path;
pub mod routes;

pub use path::{resolve, ResolvedRoute};

use std::collections::BTreeMap;

/// Upstream used for every path whose org alias is unknown or absent
pub const DEFAULT_UPSTREAM: &str = "https://registry-1.docker.io";

/// Built-in alias table, part of the public contract of the mirror
const BUILTIN_ORGS: &[(&str, &str)] = &[
    ("gcr", "https://gcr.io"),
    ("k8sgcr", "https://k8s.gcr.io"),
    ("quay", "https://quay.io"),
    ("ghcr", "https://ghcr.io"),
];

/// Registry API actions recognised when deciding whether a path needs the
/// implicit `library/` namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryAction {
    Manifests,
    Blobs,
    Tags,
    Referrers,
}

impl RegistryAction {
    /// Exact, case-sensitive match against the distribution API action names
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "manifests" => Some(Self::Manifests),
            "blobs" => Some(Self::Blobs),
            "tags" => Some(Self::Tags),
            "referrers" => Some(Self::Referrers),
            _ => None,
        }
    }
}

/// Immutable mapping from lowercase org alias to upstream base URL
///
/// Built once at startup and shared by reference with every request. Aliases
/// that are not in the table resolve to [`DEFAULT_UPSTREAM`].
#[derive(Debug, Clone)]
pub struct OrgRegistry {
    orgs: BTreeMap<String, String>,
    default_upstream: String,
}

impl Default for OrgRegistry {
    fn default() -> Self {
        let orgs = BUILTIN_ORGS
            .iter()
            .map(|(alias, url)| (alias.to_string(), url.to_string()))
            .collect();

        Self {
            orgs,
            default_upstream: DEFAULT_UPSTREAM.to_string(),
        }
    }
}

impl OrgRegistry {
    /// Extend the built-in table with additional aliases
    ///
    /// Aliases are case-folded to lowercase. Built-in aliases always win over
    /// configured ones; settings validation rejects such collisions before
    /// this is reached.
    pub fn with_extra_orgs<'a, I>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (alias, url) in extra {
            self.orgs
                .entry(alias.to_lowercase())
                .or_insert_with(|| url.trim_end_matches('/').to_string());
        }
        self
    }

    /// Whether `alias` names one of the built-in contract aliases
    pub fn is_builtin(alias: &str) -> bool {
        BUILTIN_ORGS.iter().any(|(name, _)| *name == alias)
    }

    /// Upstream base URL for a known alias
    pub fn get(&self, alias: &str) -> Option<&str> {
        self.orgs.get(alias).map(String::as_str)
    }

    pub fn is_known(&self, alias: &str) -> bool {
        self.orgs.contains_key(alias)
    }

    pub fn default_upstream(&self) -> &str {
        &self.default_upstream
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.orgs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
