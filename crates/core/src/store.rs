//! Local image store
//!
//! Tar load, tag, inspect, push, and remove against the local image daemon,
//! driven through the docker CLI. Push output is scanned for inline JSON
//! error payloads: the daemon reports some failures in the stream while
//! still exiting zero.

use crate::errors::{Result, WarpgateError};
use crate::redaction;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Details reported by image inspection
#[derive(Debug, Clone, Default)]
pub struct ImageDetails {
    pub id: String,
    pub repo_digests: Vec<String>,
}

impl ImageDetails {
    /// The canonical digest: the part after `@` of the first repo digest,
    /// falling back to the image ID when no repo digest exists.
    pub fn digest(&self) -> String {
        self.repo_digests
            .first()
            .and_then(|entry| entry.split_once('@').map(|(_, digest)| digest.to_string()))
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Image store operations used by the build pipeline
#[async_trait::async_trait]
pub trait ImageStore: Send + Sync {
    /// Import an image tarball produced by the build daemon.
    async fn load(&self, tar_path: &Path, cancel: &CancellationToken) -> Result<()>;

    /// Add an alias for an existing image; no content is copied.
    async fn tag(&self, src_ref: &str, new_ref: &str, cancel: &CancellationToken) -> Result<()>;

    /// Inspect an image, returning its ID and repo digests.
    async fn inspect(&self, image_ref: &str, cancel: &CancellationToken) -> Result<ImageDetails>;

    /// Push an image to its registry; returns the registry-assigned digest
    /// (empty when the daemon did not report one).
    async fn push(&self, image_ref: &str, cancel: &CancellationToken) -> Result<String>;

    /// Remove a tag. Fails while a running container still references it.
    async fn remove(&self, image_ref: &str, cancel: &CancellationToken) -> Result<()>;
}

/// CLI-backed image store using the docker binary
#[derive(Debug, Clone)]
pub struct CliImageStore {
    docker_path: String,
}

impl Default for CliImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CliImageStore {
    pub fn new() -> Self {
        Self {
            docker_path: "docker".to_string(),
        }
    }

    pub fn with_path(docker_path: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
        }
    }

    async fn run(&self, args: &[&str], cancel: &CancellationToken) -> Result<std::process::Output> {
        debug!(command = %format!("{} {}", self.docker_path, args.join(" ")), "running image daemon command");
        let child = Command::new(&self.docker_path)
            .args(args)
            .stdin(Stdio::null())
            .output();

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WarpgateError::Cancelled),
            result = child => result?,
        };

        if !output.status.success() {
            let stderr = redaction::redact(String::from_utf8_lossy(&output.stderr).trim());
            return Err(WarpgateError::transport(format!(
                "docker {} failed: {stderr}",
                args.first().unwrap_or(&"")
            )));
        }
        Ok(output)
    }
}

/// Inline error detection on daemon output streams: a quoted `error` key
/// (also matches `errorDetail`).
fn contains_inline_error(output: &str) -> bool {
    output.contains("\"error")
}

#[async_trait::async_trait]
impl ImageStore for CliImageStore {
    async fn load(&self, tar_path: &Path, cancel: &CancellationToken) -> Result<()> {
        let path = tar_path.to_string_lossy();
        self.run(&["load", "-i", &path], cancel).await?;
        debug!(tar = %tar_path.display(), "image tarball loaded");
        Ok(())
    }

    async fn tag(&self, src_ref: &str, new_ref: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(&["tag", src_ref, new_ref], cancel).await?;
        Ok(())
    }

    async fn inspect(&self, image_ref: &str, cancel: &CancellationToken) -> Result<ImageDetails> {
        let output = self
            .run(&["inspect", "--format", "{{json .}}", image_ref], cancel)
            .await?;
        let raw: serde_json::Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            WarpgateError::transport(format!("unparseable inspect output for {image_ref}: {e}"))
        })?;

        let id = raw
            .get("Id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let repo_digests = raw
            .get("RepoDigests")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(ImageDetails { id, repo_digests })
    }

    async fn push(&self, image_ref: &str, cancel: &CancellationToken) -> Result<String> {
        let output = self.run(&["push", image_ref], cancel).await?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        // The daemon can emit an error payload mid-stream and still exit
        // zero; treat any inline error as a hard failure.
        if contains_inline_error(&combined) {
            return Err(WarpgateError::transport(format!(
                "push of {image_ref} reported an error: {}",
                redaction::redact(combined.trim())
            )));
        }

        Ok(extract_push_digest(&combined).unwrap_or_default())
    }

    async fn remove(&self, image_ref: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(&["rmi", image_ref], cancel).await?;
        debug!(image_ref, "removed image tag");
        Ok(())
    }
}

/// Pull the `sha256:...` digest out of push output
/// (`latest: digest: sha256:... size: 1234`).
fn extract_push_digest(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(idx) = line.find("digest:") {
            let rest = line[idx + "digest:".len()..].trim();
            if let Some(digest) = rest.split_whitespace().next() {
                if digest.starts_with("sha256:") {
                    return Some(digest.to_string());
                }
            }
        }
    }
    None
}
