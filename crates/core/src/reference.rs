//! Image reference parsing
//!
//! References come in the usual registry forms: `ghcr.io/owner/repo:tag`,
//! `ubuntu:latest`, `localhost:5000/x`, `repo@sha256:...`. The first path
//! segment is a registry host only when it looks like one (contains `.` or
//! `:`, or is `localhost`); everything else defaults to Docker Hub.

use crate::errors::{Result, WarpgateError};
use url::Url;

/// Default registry assumed when a reference carries no host
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Docker Hub's API endpoint differs from its reference name.
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// A parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(WarpgateError::resolution(
                "image reference",
                "empty reference",
            ));
        }

        // Split off any @digest first so its ':' never masquerades as a tag.
        let (repo_part, digest) = match reference.rsplit_once('@') {
            Some((repo, digest)) => (repo, Some(digest.to_string())),
            None => (reference, None),
        };

        let (registry, remainder) = split_registry(repo_part);

        // A ':' after the last '/' is a tag separator.
        let (repository, tag) = match remainder.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => {
                (repo.to_string(), Some(tag.to_string()))
            }
            _ => (remainder.to_string(), None),
        };

        if repository.is_empty() {
            return Err(WarpgateError::resolution(
                "image reference",
                format!("no repository in {reference:?}"),
            ));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Tag to use when none was given.
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// Hostname to direct API calls at. Docker Hub uses a distinct API host.
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// Full reference string, `registry/repo:tag` or `registry/repo@digest`.
    pub fn to_ref_string(&self) -> String {
        match &self.digest {
            Some(digest) => format!("{}/{}@{}", self.registry, self.repository, digest),
            None => format!(
                "{}/{}:{}",
                self.registry,
                self.repository,
                self.tag_or_latest()
            ),
        }
    }
}

/// Split the registry host off an image reference (digest already removed).
fn split_registry(repo_part: &str) -> (String, String) {
    match repo_part.split_once('/') {
        Some((first, rest)) if looks_like_registry(first) => {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_REGISTRY.to_string(), repo_part.to_string()),
    }
}

fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Extract the registry host from an image reference.
///
/// `ghcr.io/owner/repo:tag` yields `ghcr.io`; `ubuntu:latest` yields
/// `docker.io`; `localhost:5000/x` yields `localhost:5000`.
pub fn registry_host(image_ref: &str) -> String {
    let without_digest = image_ref
        .rsplit_once('@')
        .map(|(repo, _)| repo)
        .unwrap_or(image_ref);
    split_registry(without_digest).0
}

/// Build the per-architecture image reference used by single-arch pushes:
/// `<registry>/<namespace>/<image>-<arch>:<tag>`, namespace omitted when
/// empty.
pub fn arch_image_ref(
    registry: &str,
    namespace: &str,
    image: &str,
    arch_label: &str,
    tag: &str,
) -> String {
    if namespace.is_empty() {
        format!("{registry}/{image}-{arch_label}:{tag}")
    } else {
        format!("{registry}/{namespace}/{image}-{arch_label}:{tag}")
    }
}

/// Build the manifest-list reference: `<registry>/<namespace>/<image>:<tag>`,
/// namespace omitted when empty.
pub fn index_image_ref(registry: &str, namespace: &str, image: &str, tag: &str) -> String {
    if namespace.is_empty() {
        format!("{registry}/{image}:{tag}")
    } else {
        format!("{registry}/{namespace}/{image}:{tag}")
    }
}

/// Inject a token into an HTTPS git URL as basic auth for the
/// `x-access-token` user.
///
/// SSH and plain-HTTP URLs are returned unchanged; the operation is
/// idempotent on HTTPS.
pub fn inject_token_into_url(raw: &str, token: &str) -> String {
    let Ok(mut parsed) = Url::parse(raw) else {
        return raw.to_string();
    };
    if parsed.scheme() != "https" {
        return raw.to_string();
    }
    if parsed.set_username("x-access-token").is_err()
        || parsed.set_password(Some(token)).is_err()
    {
        return raw.to_string();
    }
    parsed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_extraction() {
        assert_eq!(registry_host("ghcr.io/owner/repo:tag"), "ghcr.io");
        assert_eq!(registry_host("ubuntu:latest"), "docker.io");
        assert_eq!(registry_host("localhost:5000/x"), "localhost:5000");
        assert_eq!(registry_host("owner/repo:tag"), "docker.io");
        assert_eq!(
            registry_host("ghcr.io/owner/repo@sha256:abc"),
            "ghcr.io"
        );
    }

    #[test]
    fn parse_with_tag() {
        let r = ImageReference::parse("ghcr.io/cowdogmoo/attack-box:latest").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "cowdogmoo/attack-box");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn parse_with_digest() {
        let r = ImageReference::parse("ghcr.io/owner/repo@sha256:abc123").unwrap();
        assert_eq!(r.digest.as_deref(), Some("sha256:abc123"));
        assert_eq!(r.tag, None);
        assert_eq!(r.to_ref_string(), "ghcr.io/owner/repo@sha256:abc123");
    }

    #[test]
    fn parse_bare_image() {
        let r = ImageReference::parse("ubuntu").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "ubuntu");
        assert_eq!(r.tag_or_latest(), "latest");
        assert_eq!(r.api_host(), "registry-1.docker.io");
    }

    #[test]
    fn parse_localhost_port() {
        let r = ImageReference::parse("localhost:5000/my-image:v1").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "my-image");
        assert_eq!(r.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn arch_ref_construction() {
        assert_eq!(
            arch_image_ref("ghcr.io", "cowdogmoo", "attack-box", "amd64", "latest"),
            "ghcr.io/cowdogmoo/attack-box-amd64:latest"
        );
        assert_eq!(
            arch_image_ref("ghcr.io", "", "sliver", "arm64", "v1.0.0"),
            "ghcr.io/sliver-arm64:v1.0.0"
        );
    }

    #[test]
    fn token_injection_https_only() {
        assert_eq!(
            inject_token_into_url("https://github.com/org/repo.git", "T"),
            "https://x-access-token:T@github.com/org/repo.git"
        );
        assert_eq!(
            inject_token_into_url("git@github.com:org/repo.git", "T"),
            "git@github.com:org/repo.git"
        );
        assert_eq!(inject_token_into_url("http://h/r", "T"), "http://h/r");
    }

    #[test]
    fn token_injection_is_idempotent() {
        let once = inject_token_into_url("https://github.com/org/repo.git", "T");
        let twice = inject_token_into_url(&once, "T");
        assert_eq!(once, twice);
    }
}
