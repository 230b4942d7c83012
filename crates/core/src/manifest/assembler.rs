//! Multi-architecture manifest assembly
//!
//! Turns a directory of digest files into a published manifest index:
//! discover, validate, filter, verify each per-arch image against the
//! registry with bounded concurrency, then assemble and push the index.

use crate::errors::{FailedItem, Result, WarpgateError};
use crate::manifest::digest_file::{
    discover_digest_files, filter_by_required, validate_digest_files, DigestFile,
};
use crate::platform::{split_arch_label, Platform};
use crate::reference::{arch_image_ref, index_image_ref};
use crate::registry::{
    Descriptor, ImageIndex, RegistryClient, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX,
};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry lookups during verification and assembly fan out this wide.
const VERIFY_CONCURRENCY: usize = 4;

/// Settings for one assembly run
#[derive(Debug, Clone)]
pub struct ManifestOptions {
    pub registry: String,
    pub namespace: String,
    pub image: String,
    pub tag: String,
    /// Architectures the index must cover. Empty keeps all discovered.
    pub required_architectures: Vec<String>,
    /// Downgrade missing required architectures to a warning.
    pub best_effort: bool,
    /// Reject digest files older than this.
    pub max_age: Option<Duration>,
    /// Verify every per-arch image exists in the registry before pushing.
    pub verify: bool,
    /// Fail the run when a per-entry descriptor fetch fails during
    /// assembly instead of skipping the entry.
    pub strict_entries: bool,
    /// Push an OCI image index instead of a Docker manifest list.
    pub use_oci_index: bool,
}

impl ManifestOptions {
    fn index_ref(&self) -> String {
        index_image_ref(&self.registry, &self.namespace, &self.image, &self.tag)
    }

    fn arch_ref(&self, arch_label: &str) -> String {
        arch_image_ref(
            &self.registry,
            &self.namespace,
            &self.image,
            arch_label,
            &self.tag,
        )
    }

    fn media_type(&self) -> &'static str {
        if self.use_oci_index {
            MEDIA_TYPE_OCI_INDEX
        } else {
            MEDIA_TYPE_DOCKER_MANIFEST_LIST
        }
    }
}

/// One entry destined for the manifest index
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub image_ref: String,
    pub digest: String,
    pub media_type: String,
    pub size: i64,
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl ManifestEntry {
    /// Canonical `os/arch[/variant]` string.
    pub fn platform(&self) -> String {
        Platform {
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            variant: self.variant.clone(),
        }
        .format()
    }

    fn to_descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.size,
            platform: Some(Platform {
                os: self.os.clone(),
                architecture: self.architecture.clone(),
                variant: self.variant.clone(),
            }),
            annotations: None,
        }
    }
}

/// Outcome of a successful assembly
#[derive(Debug, Clone)]
pub struct AssembledIndex {
    pub index_ref: String,
    pub digest: String,
    pub entries: Vec<ManifestEntry>,
}

/// Builds and publishes manifest indexes from digest files
pub struct ManifestAssembler {
    client: RegistryClient,
    options: ManifestOptions,
}

impl ManifestAssembler {
    pub fn new(client: RegistryClient, options: ManifestOptions) -> Self {
        Self { client, options }
    }

    /// Full pipeline: digest files in `dir` to a pushed index.
    pub async fn assemble_from_dir(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<AssembledIndex> {
        let discovered = discover_digest_files(dir, &self.options.image)?;
        if discovered.is_empty() {
            return Err(WarpgateError::resolution(
                dir.display().to_string(),
                format!("no digest files found for image {:?}", self.options.image),
            ));
        }
        validate_digest_files(&discovered, &self.options.image, self.options.max_age)?;
        let kept = filter_by_required(
            discovered,
            &self.options.required_architectures,
            self.options.best_effort,
        )?;

        if self.options.verify {
            self.verify_entries(&kept, cancel).await?;
        }

        let entries = self.inspect_entries(&kept, cancel).await?;
        self.push_index(entries, cancel).await
    }

    /// Verification without publication: discover, validate, filter, and
    /// check every per-arch image against the registry. Returns how many
    /// entries verified.
    pub async fn verify_from_dir(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let discovered = discover_digest_files(dir, &self.options.image)?;
        validate_digest_files(&discovered, &self.options.image, self.options.max_age)?;
        let kept = filter_by_required(
            discovered,
            &self.options.required_architectures,
            self.options.best_effort,
        )?;
        self.verify_entries(&kept, cancel).await?;
        Ok(kept.len())
    }

    /// Verify every kept per-arch image resolves in the registry. Lookups
    /// run with bounded concurrency; failures aggregate in discovery
    /// order.
    async fn verify_entries(
        &self,
        files: &[DigestFile],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total = files.len();
        let results: Vec<(String, Result<Descriptor>)> = stream::iter(files.iter())
            .map(|file| {
                let image_ref = self.options.arch_ref(&file.architecture);
                async move {
                    let result = self.client.get_descriptor(&image_ref, cancel).await;
                    (image_ref, result)
                }
            })
            .buffered(VERIFY_CONCURRENCY)
            .collect()
            .await;

        let mut failures = Vec::new();
        for (image_ref, result) in results {
            match result {
                Ok(descriptor) => {
                    debug!(image_ref, digest = %descriptor.digest, "verified in registry")
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => failures.push(FailedItem {
                    item: image_ref,
                    reason: e.to_string(),
                }),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(WarpgateError::PartialFailure { total, failures })
        }
    }

    /// Fetch the authoritative descriptor for every entry. Failures skip
    /// the entry with a warning, or fail the run under `strict_entries`.
    async fn inspect_entries(
        &self,
        files: &[DigestFile],
        cancel: &CancellationToken,
    ) -> Result<Vec<ManifestEntry>> {
        let total = files.len();
        let results: Vec<(String, String, Result<Descriptor>)> = stream::iter(files.iter())
            .map(|file| {
                let image_ref = self.options.arch_ref(&file.architecture);
                let arch_label = file.architecture.clone();
                async move {
                    let result = self.client.get_descriptor(&image_ref, cancel).await;
                    (image_ref, arch_label, result)
                }
            })
            .buffered(VERIFY_CONCURRENCY)
            .collect()
            .await;

        let mut entries = Vec::new();
        let mut failures = Vec::new();
        for (image_ref, arch_label, result) in results {
            match result {
                Ok(descriptor) => {
                    let (architecture, variant) = split_arch_label(&arch_label);
                    entries.push(ManifestEntry {
                        image_ref,
                        digest: descriptor.digest,
                        media_type: descriptor.media_type,
                        size: descriptor.size,
                        os: "linux".to_string(),
                        architecture,
                        variant,
                    });
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if self.options.strict_entries => failures.push(FailedItem {
                    item: image_ref,
                    reason: e.to_string(),
                }),
                Err(e) => {
                    warn!(image_ref, error = %e, "skipping index entry, descriptor fetch failed");
                }
            }
        }

        if !failures.is_empty() {
            return Err(WarpgateError::PartialFailure { total, failures });
        }
        Ok(entries)
    }

    /// Assemble and push the index. An index with zero entries is never
    /// pushed.
    async fn push_index(
        &self,
        entries: Vec<ManifestEntry>,
        cancel: &CancellationToken,
    ) -> Result<AssembledIndex> {
        let index_ref = self.options.index_ref();
        if entries.is_empty() {
            return Err(WarpgateError::resolution(
                index_ref,
                "no manifest entries remain, refusing to push an empty index",
            ));
        }

        if self
            .client
            .manifest_exists(&index_ref, cancel)
            .await
            .unwrap_or(false)
        {
            // Pushing identical content is idempotent, so an existing tag
            // is informational only.
            info!(index_ref, "tag already exists, re-pushing");
        }

        let descriptors = entries.iter().map(ManifestEntry::to_descriptor).collect();
        let index = ImageIndex::new(self.options.media_type(), descriptors);
        let digest = self.client.put_index(&index_ref, &index, cancel).await?;
        info!(index_ref, digest = %digest, entries = entries.len(), "pushed manifest index");

        Ok(AssembledIndex {
            index_ref,
            digest,
            entries,
        })
    }
}
