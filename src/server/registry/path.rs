//! Path grammar for the registry API surface
//!
//! Inbound paths look like `/v2/<org>/<repo...>/<action>/<reference>`. The
//! second segment picks the upstream registry; the resolver strips it for
//! known aliases and adds the implicit `library/` namespace for single-name
//! Docker Hub images.

use super::{OrgRegistry, RegistryAction};

/// Namespace Docker Hub uses for official images
const LIBRARY_NAMESPACE: &str = "library";

/// Outcome of resolving one inbound registry path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    /// Lowercase org alias taken from the path, empty if the path has none
    pub org: String,
    /// Upstream base URL the request is sent to
    pub upstream: String,
    /// Path in the form the upstream expects
    pub path: String,
}

/// Resolve the upstream host and rewritten path for an inbound path
pub fn resolve(registry: &OrgRegistry, path: &str) -> ResolvedRoute {
    let org = org_name_from_path(path);
    let rewritten = rewrite_path(registry, &org, path);
    let upstream = host_by_org_name(registry, &org).to_string();

    ResolvedRoute {
        org,
        upstream,
        path: rewritten,
    }
}

/// Lowercase org alias at segment 2 of a `/v2/...` path, or an empty string
pub fn org_name_from_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() >= 3 && segments[1] == "v2" && !segments[2].is_empty() {
        segments[2].to_lowercase()
    } else {
        String::new()
    }
}

/// Upstream base URL for `org`, falling back to Docker Hub
pub fn host_by_org_name<'a>(registry: &'a OrgRegistry, org: &str) -> &'a str {
    registry
        .get(org)
        .unwrap_or_else(|| registry.default_upstream())
}

/// Rewrite `path` into the form the upstream for `org` expects
///
/// Rules, first match wins:
/// 1. unknown non-empty org, exactly five segments and a recognised action at
///    offset 3: insert `library` after `v2`. `library` itself passes through
///    so already-qualified official images are not prefixed twice.
/// 2. empty org: unchanged.
/// 3. known alias: drop the alias segment.
/// 4. anything else: unchanged.
///
/// An unrecognised action at offset 3 is forwarded unchanged and left for the
/// upstream to reject.
pub fn rewrite_path(registry: &OrgRegistry, org: &str, path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();

    if !org.is_empty()
        && !registry.is_known(org)
        && org != LIBRARY_NAMESPACE
        && segments.len() == 5
        && RegistryAction::parse(segments[3]).is_some()
    {
        let rewritten = [
            segments[0],
            segments[1],
            LIBRARY_NAMESPACE,
            segments[2],
            segments[3],
            segments[4],
        ];
        return rewritten.join("/");
    }

    if org.is_empty() {
        return path.to_string();
    }

    if registry.is_known(org) {
        // The alias was derived from segment 2, so it is removed by position
        // regardless of the casing used in the inbound path.
        return segments
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 2)
            .map(|(_, s)| *s)
            .collect::<Vec<_>>()
            .join("/");
    }

    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> OrgRegistry {
        OrgRegistry::default()
    }

    #[test]
    fn test_org_name_from_path() {
        assert_eq!(org_name_from_path("/v2/gcr/foo/manifests/latest"), "gcr");
        assert_eq!(org_name_from_path("/v2/QUAY/foo"), "quay");
        assert_eq!(org_name_from_path("/v2/nginx"), "nginx");
        assert_eq!(org_name_from_path("/v2/"), "");
        assert_eq!(org_name_from_path("/v2"), "");
        assert_eq!(org_name_from_path("/v1/gcr/foo"), "");
        assert_eq!(org_name_from_path("/"), "");
        assert_eq!(org_name_from_path(""), "");
    }

    #[test]
    fn test_host_by_org_name() {
        let registry = registry();
        assert_eq!(host_by_org_name(&registry, "ghcr"), "https://ghcr.io");
        assert_eq!(
            host_by_org_name(&registry, "nginx"),
            "https://registry-1.docker.io"
        );
        assert_eq!(
            host_by_org_name(&registry, ""),
            "https://registry-1.docker.io"
        );
    }

    #[test]
    fn test_known_aliases_strip_org_segment() {
        let registry = registry();
        for (alias, upstream) in [
            ("gcr", "https://gcr.io"),
            ("k8sgcr", "https://k8s.gcr.io"),
            ("quay", "https://quay.io"),
            ("ghcr", "https://ghcr.io"),
        ] {
            let route = resolve(&registry, &format!("/v2/{}/repo/manifests/latest", alias));
            assert_eq!(route.org, alias);
            assert_eq!(route.upstream, upstream);
            assert_eq!(route.path, "/v2/repo/manifests/latest");
        }
    }

    #[test]
    fn test_alias_lookup_is_case_insensitive() {
        let registry = registry();
        let upper = resolve(&registry, "/v2/GCR/repo/manifests/latest");
        let lower = resolve(&registry, "/v2/gcr/repo/manifests/latest");
        assert_eq!(upper, lower);
        assert_eq!(upper.path, "/v2/repo/manifests/latest");
    }

    #[test]
    fn test_single_name_image_gets_library_namespace() {
        let route = resolve(&registry(), "/v2/nginx/manifests/latest");
        assert_eq!(route.org, "nginx");
        assert_eq!(route.upstream, "https://registry-1.docker.io");
        assert_eq!(route.path, "/v2/library/nginx/manifests/latest");

        let route = resolve(&registry(), "/v2/mysql/blobs/sha256:abc");
        assert_eq!(route.path, "/v2/library/mysql/blobs/sha256:abc");

        let route = resolve(&registry(), "/v2/alpine/tags/list");
        assert_eq!(route.path, "/v2/library/alpine/tags/list");

        let route = resolve(&registry(), "/v2/alpine/referrers/sha256:abc");
        assert_eq!(route.path, "/v2/library/alpine/referrers/sha256:abc");
    }

    #[test]
    fn test_library_namespace_passes_through() {
        let route = resolve(&registry(), "/v2/library/nginx/manifests/latest");
        assert_eq!(route.org, "library");
        assert_eq!(route.upstream, "https://registry-1.docker.io");
        assert_eq!(route.path, "/v2/library/nginx/manifests/latest");
    }

    #[test]
    fn test_repository_named_library_is_not_prefixed() {
        // Indistinguishable from the namespace, so it passes through as-is.
        let route = resolve(&registry(), "/v2/library/manifests/latest");
        assert_eq!(route.path, "/v2/library/manifests/latest");
    }

    #[test]
    fn test_user_namespaced_docker_hub_image_unchanged() {
        let route = resolve(&registry(), "/v2/bitnami/redis/manifests/7.2");
        assert_eq!(route.org, "bitnami");
        assert_eq!(route.upstream, "https://registry-1.docker.io");
        assert_eq!(route.path, "/v2/bitnami/redis/manifests/7.2");
    }

    #[test]
    fn test_unknown_action_passes_through() {
        let route = resolve(&registry(), "/v2/nginx/uploads/abc");
        assert_eq!(route.path, "/v2/nginx/uploads/abc");

        let route = resolve(&registry(), "/v2/nginx/Manifests/latest");
        assert_eq!(route.path, "/v2/nginx/Manifests/latest");
    }

    #[test]
    fn test_non_registry_paths_unchanged() {
        let registry = registry();
        for path in ["/v2/", "/v2", "/", "/health", "/v1/nginx/manifests/latest"] {
            let route = resolve(&registry, path);
            assert_eq!(route.org, "");
            assert_eq!(route.path, path);
            assert_eq!(route.upstream, "https://registry-1.docker.io");
        }
    }

    #[test]
    fn test_quay_nested_repository() {
        let route = resolve(&registry(), "/v2/quay/foo/bar/manifests/v1");
        assert_eq!(route.org, "quay");
        assert_eq!(route.upstream, "https://quay.io");
        assert_eq!(route.path, "/v2/foo/bar/manifests/v1");
    }

    #[test]
    fn test_alias_segment_only_removed_at_org_position() {
        let route = resolve(&registry(), "/v2/gcr/gcr/manifests/latest");
        assert_eq!(route.path, "/v2/gcr/manifests/latest");
    }

    #[test]
    fn test_bare_alias_path() {
        let route = resolve(&registry(), "/v2/ghcr/");
        assert_eq!(route.upstream, "https://ghcr.io");
        assert_eq!(route.path, "/v2/");
    }
}
