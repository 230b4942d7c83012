//! Manifest inspection
//!
//! Resolves a reference to a [`ManifestInfo`]: for an index, the platform
//! list comes from its descriptors; for a single-arch manifest, from the
//! referenced config blob. A config blob that cannot be fetched degrades
//! the platform to `unknown` without failing the inspection.

use crate::errors::Result;
use crate::reference::ImageReference;
use crate::registry::types::{
    is_index_media_type, ImageConfigBlob, ImageIndex, ImageManifest,
};
use crate::registry::RegistryClient;
use indexmap::IndexMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Platform information for one entry of an inspected manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchitectureInfo {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
    pub digest: String,
    pub size: i64,
    pub media_type: String,
}

/// Inspection result for a manifest or index
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestInfo {
    pub name: String,
    pub tag: String,
    pub digest: String,
    pub media_type: String,
    pub size: i64,
    pub annotations: IndexMap<String, String>,
    pub architectures: Vec<ArchitectureInfo>,
}

/// Reads manifests back out of a registry
pub struct ManifestInspector {
    client: RegistryClient,
}

impl ManifestInspector {
    pub fn new(client: RegistryClient) -> Self {
        Self { client }
    }

    pub async fn inspect(
        &self,
        image_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<ManifestInfo> {
        let reference = ImageReference::parse(image_ref)?;
        let (body, descriptor) = self.client.get_manifest(image_ref, cancel).await?;

        let mut info = ManifestInfo {
            name: reference.repository.clone(),
            tag: reference.tag_or_latest().to_string(),
            digest: descriptor.digest.clone(),
            media_type: descriptor.media_type.clone(),
            size: descriptor.size,
            annotations: IndexMap::new(),
            architectures: Vec::new(),
        };

        if is_index_media_type(&descriptor.media_type) || looks_like_index(&body) {
            let index: ImageIndex = serde_json::from_slice(&body).map_err(|e| {
                crate::errors::WarpgateError::transport(format!(
                    "malformed index body for {image_ref}: {e}"
                ))
            })?;
            if !index.media_type.is_empty() {
                info.media_type = index.media_type.clone();
            }
            if let Some(annotations) = &index.annotations {
                info.annotations = annotations.clone();
            }
            for entry in &index.manifests {
                let platform = entry.platform.clone();
                info.architectures.push(ArchitectureInfo {
                    os: platform
                        .as_ref()
                        .map(|p| p.os.clone())
                        .unwrap_or_else(|| "unknown".to_string()),
                    architecture: platform
                        .as_ref()
                        .map(|p| p.architecture.clone())
                        .unwrap_or_else(|| "unknown".to_string()),
                    variant: platform.and_then(|p| p.variant),
                    digest: entry.digest.clone(),
                    size: entry.size,
                    media_type: entry.media_type.clone(),
                });
            }
            debug!(image_ref, platforms = info.architectures.len(), "inspected index");
            return Ok(info);
        }

        let manifest: ImageManifest = serde_json::from_slice(&body).map_err(|e| {
            crate::errors::WarpgateError::transport(format!(
                "malformed manifest body for {image_ref}: {e}"
            ))
        })?;
        if let Some(annotations) = &manifest.annotations {
            info.annotations = annotations.clone();
        }

        // Single-arch: platform lives in the config blob. Fetch failure
        // reports `unknown`, not an error.
        let (os, architecture, variant) = match self
            .client
            .get_blob(image_ref, &manifest.config.digest, cancel)
            .await
            .ok()
            .and_then(|blob| serde_json::from_slice::<ImageConfigBlob>(&blob).ok())
        {
            Some(blob) => {
                let os = if blob.os.is_empty() {
                    "unknown".to_string()
                } else {
                    blob.os
                };
                let architecture = if blob.architecture.is_empty() {
                    "unknown".to_string()
                } else {
                    blob.architecture
                };
                (os, architecture, blob.variant)
            }
            None => {
                warn!(image_ref, "config blob unavailable, platform unknown");
                ("unknown".to_string(), "unknown".to_string(), None)
            }
        };

        info.architectures.push(ArchitectureInfo {
            os,
            architecture,
            variant,
            digest: manifest.config.digest.clone(),
            size: manifest.config.size,
            media_type: manifest.config.media_type.clone(),
        });
        Ok(info)
    }
}

/// Bodies without a media-type header still reveal themselves: an index
/// has a `manifests` array, a manifest a `config` object.
fn looks_like_index(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .map(|value| value.get("manifests").is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::types::{
        MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_INDEX,
    };
    use crate::registry::{CredentialStore, HttpResponse, MockHttpClient, RegistryClient};
    use bytes::Bytes;
    use std::sync::Arc;

    fn response(status: u16, headers: &[(&str, &str)], body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    fn inspector(mock: MockHttpClient) -> ManifestInspector {
        ManifestInspector::new(RegistryClient::with_http_client(
            Arc::new(mock),
            CredentialStore::new(),
        ))
    }

    #[tokio::test]
    async fn inspects_an_index() {
        let body = format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "{MEDIA_TYPE_OCI_INDEX}",
                "manifests": [
                    {{"mediaType": "{MEDIA_TYPE_DOCKER_MANIFEST}", "digest": "sha256:aaa", "size": 1,
                      "platform": {{"os": "linux", "architecture": "amd64"}}}},
                    {{"mediaType": "{MEDIA_TYPE_DOCKER_MANIFEST}", "digest": "sha256:bbb", "size": 2,
                      "platform": {{"os": "linux", "architecture": "arm", "variant": "v7"}}}}
                ],
                "annotations": {{"org.opencontainers.image.source": "https://github.com/x/y"}}
            }}"#
        );
        let mock = MockHttpClient::new();
        mock.add_response(
            "https://ghcr.io/v2/owner/repo/manifests/latest",
            response(
                200,
                &[
                    ("docker-content-digest", "sha256:idx"),
                    ("content-type", MEDIA_TYPE_OCI_INDEX),
                ],
                &body,
            ),
        )
        .await;

        let cancel = CancellationToken::new();
        let info = inspector(mock)
            .inspect("ghcr.io/owner/repo:latest", &cancel)
            .await
            .unwrap();
        assert_eq!(info.name, "owner/repo");
        assert_eq!(info.tag, "latest");
        assert_eq!(info.digest, "sha256:idx");
        assert_eq!(info.architectures.len(), 2);
        assert_eq!(info.architectures[0].architecture, "amd64");
        assert_eq!(info.architectures[1].variant.as_deref(), Some("v7"));
        assert_eq!(
            info.annotations
                .get("org.opencontainers.image.source")
                .map(String::as_str),
            Some("https://github.com/x/y")
        );
    }

    #[tokio::test]
    async fn single_manifest_reads_config_blob() {
        let manifest = format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "{MEDIA_TYPE_DOCKER_MANIFEST}",
                "config": {{"mediaType": "{MEDIA_TYPE_OCI_CONFIG}", "digest": "sha256:cfg", "size": 7}},
                "layers": []
            }}"#
        );
        let mock = MockHttpClient::new();
        mock.add_response(
            "https://ghcr.io/v2/owner/repo/manifests/latest",
            response(
                200,
                &[
                    ("docker-content-digest", "sha256:man"),
                    ("content-type", MEDIA_TYPE_DOCKER_MANIFEST),
                ],
                &manifest,
            ),
        )
        .await;
        mock.add_response(
            "https://ghcr.io/v2/owner/repo/blobs/sha256:cfg",
            response(200, &[], r#"{"os": "linux", "architecture": "arm64"}"#),
        )
        .await;

        let cancel = CancellationToken::new();
        let info = inspector(mock)
            .inspect("ghcr.io/owner/repo:latest", &cancel)
            .await
            .unwrap();
        assert_eq!(info.architectures.len(), 1);
        assert_eq!(info.architectures[0].os, "linux");
        assert_eq!(info.architectures[0].architecture, "arm64");
    }

    #[tokio::test]
    async fn config_blob_failure_degrades_to_unknown() {
        let manifest = format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "{MEDIA_TYPE_DOCKER_MANIFEST}",
                "config": {{"mediaType": "{MEDIA_TYPE_OCI_CONFIG}", "digest": "sha256:cfg", "size": 7}},
                "layers": []
            }}"#
        );
        let mock = MockHttpClient::new();
        mock.add_response(
            "https://ghcr.io/v2/owner/repo/manifests/latest",
            response(
                200,
                &[("content-type", MEDIA_TYPE_DOCKER_MANIFEST)],
                &manifest,
            ),
        )
        .await;
        // No blob response queued: the fetch fails.

        let cancel = CancellationToken::new();
        let info = inspector(mock)
            .inspect("ghcr.io/owner/repo:latest", &cancel)
            .await
            .unwrap();
        assert_eq!(info.architectures[0].os, "unknown");
        assert_eq!(info.architectures[0].architecture, "unknown");
    }
}
