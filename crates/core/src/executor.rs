//! Build execution
//!
//! Submits a compiled graph to a BuildKit daemon through the buildx CLI,
//! streams progress, exports the image as a local tarball, loads it into
//! the image store, and resolves the resulting digest. The temp tarball is
//! removed on every exit path.

use crate::errors::{Result, WarpgateError};
use crate::graph::BuildGraph;
use crate::redaction;
use crate::store::ImageStore;
use crate::template::PullPolicy;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Containers run by the buildx docker-container driver carry this name
/// prefix.
pub const BUILDKIT_CONTAINER_PREFIX: &str = "buildx_buildkit_";

/// TLS material for a TCP daemon endpoint
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

/// Build daemon connection settings
#[derive(Debug, Clone, Default)]
pub struct BuilderConfig {
    /// Explicit endpoint: a named buildx builder or a `tcp://` address.
    /// When unset, a running BuildKit container is auto-detected.
    pub endpoint: Option<String>,
    /// TLS files for TCP endpoints.
    pub tls: Option<TlsFiles>,
    /// docker binary, overridable for tests.
    pub docker_path: Option<String>,
}

/// A resolved daemon endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuilderEndpoint {
    /// Named buildx builder instance.
    Named(String),
    /// Remote TCP daemon; TLS is optional but warned about when absent.
    Tcp { address: String },
    /// BuildKit container detected on the local daemon.
    Container(String),
}

/// One build to execute
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub graph: BuildGraph,
    pub context_dir: PathBuf,
    /// Name the exported image is loaded under.
    pub image_ref: String,
    /// Additional alias applied after load; failures are non-fatal.
    pub alias: Option<String>,
    pub labels: indexmap::IndexMap<String, String>,
    /// `type=registry,ref=...[,mode=...]` cache specs.
    pub cache_from: Vec<String>,
    pub cache_to: Vec<String>,
    pub no_cache: bool,
}

/// Outcome of one per-architecture build
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub image_ref: String,
    /// Content digest; empty when the daemon reported none.
    pub digest: String,
    /// `os/arch` pair.
    pub platform: String,
    pub architecture: String,
    pub duration: Duration,
    pub notes: Vec<String>,
}

/// Executes builds against a BuildKit daemon
pub struct BuildExecutor {
    config: BuilderConfig,
    store: Arc<dyn ImageStore>,
}

impl BuildExecutor {
    pub fn new(config: BuilderConfig, store: Arc<dyn ImageStore>) -> Self {
        Self { config, store }
    }

    fn docker_path(&self) -> &str {
        self.config.docker_path.as_deref().unwrap_or("docker")
    }

    /// Resolve the daemon endpoint: explicit configuration first, then a
    /// locally running BuildKit container.
    pub async fn resolve_endpoint(&self, cancel: &CancellationToken) -> Result<BuilderEndpoint> {
        if let Some(endpoint) = &self.config.endpoint {
            if let Some(address) = endpoint.strip_prefix("tcp://") {
                if self.config.tls.is_none() {
                    warn!(address, "TLS disabled on TCP build daemon endpoint");
                }
                return Ok(BuilderEndpoint::Tcp {
                    address: format!("tcp://{address}"),
                });
            }
            return Ok(BuilderEndpoint::Named(endpoint.clone()));
        }

        let output = self
            .run_docker(
                &[
                    "ps",
                    "--filter",
                    &format!("name={BUILDKIT_CONTAINER_PREFIX}"),
                    "--format",
                    "{{.Names}}",
                ],
                cancel,
            )
            .await?;
        let names = String::from_utf8_lossy(&output.stdout);
        match names.lines().find(|l| !l.trim().is_empty()) {
            Some(name) => Ok(BuilderEndpoint::Container(name.trim().to_string())),
            None => Err(WarpgateError::configuration(
                "no build daemon endpoint configured and no running BuildKit container found",
            )),
        }
    }

    /// Execute one build: solve, export tar, load, inspect.
    pub async fn build(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildResult> {
        let started = Instant::now();
        let endpoint = self.resolve_endpoint(cancel).await?;

        // Scoped resources: a transient remote builder (TCP endpoints
        // only) and the export tarball.
        let (builder_arg, builder_cleanup) = self.prepare_builder(&endpoint, cancel).await?;
        let tar_path = export_tar_path();

        let outcome = self
            .solve_and_load(request, builder_arg.as_deref(), &tar_path, cancel)
            .await;

        remove_file_quietly(&tar_path);
        if let Some(builder) = builder_cleanup {
            self.remove_builder(&builder).await;
        }

        let mut notes = outcome?;

        let digest = match self.store.inspect(&request.image_ref, cancel).await {
            Ok(details) => details.digest(),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                // A missing digest does not fail the build.
                warn!(image_ref = %request.image_ref, error = %e, "could not inspect built image");
                notes.push("digest unavailable after load".to_string());
                String::new()
            }
        };

        let platform = &request.graph.base.platform;
        Ok(BuildResult {
            image_ref: request.image_ref.clone(),
            digest,
            platform: format!("{}/{}", platform.os, platform.architecture),
            architecture: platform.architecture.clone(),
            duration: started.elapsed(),
            notes,
        })
    }

    /// Returns the `--builder` argument and, for transient builders, the
    /// name to remove afterwards.
    async fn prepare_builder(
        &self,
        endpoint: &BuilderEndpoint,
        cancel: &CancellationToken,
    ) -> Result<(Option<String>, Option<String>)> {
        match endpoint {
            BuilderEndpoint::Named(name) => Ok((Some(name.clone()), None)),
            BuilderEndpoint::Container(container) => {
                Ok((Some(builder_name_from_container(container)), None))
            }
            BuilderEndpoint::Tcp { address } => {
                let name = format!("warpgate-remote-{}", Utc::now().timestamp());
                let mut args: Vec<String> = vec![
                    "buildx".into(),
                    "create".into(),
                    "--name".into(),
                    name.clone(),
                    "--driver".into(),
                    "remote".into(),
                ];
                if let Some(tls) = &self.config.tls {
                    args.push("--driver-opt".into());
                    args.push(format!(
                        "cacert={},cert={},key={}",
                        tls.ca_cert.display(),
                        tls.client_cert.display(),
                        tls.client_key.display()
                    ));
                }
                args.push(address.clone());
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                self.run_docker(&arg_refs, cancel).await?;
                debug!(builder = %name, address, "created transient remote builder");
                Ok((Some(name.clone()), Some(name)))
            }
        }
    }

    async fn remove_builder(&self, name: &str) {
        let result = Command::new(self.docker_path())
            .args(["buildx", "rm", name])
            .stdin(Stdio::null())
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                debug!(builder = name, "removed transient builder");
            }
            Ok(output) => {
                warn!(builder = name, stderr = %String::from_utf8_lossy(&output.stderr).trim(), "failed to remove transient builder");
            }
            Err(e) => warn!(builder = name, error = %e, "failed to remove transient builder"),
        }
    }

    async fn solve_and_load(
        &self,
        request: &BuildRequest,
        builder: Option<&str>,
        tar_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut notes = Vec::new();

        // Marshal the graph into the daemon's frontend format.
        let dockerfile = tempfile::Builder::new()
            .prefix("warpgate-graph-")
            .suffix(".dockerfile")
            .tempfile()?;
        tokio::fs::write(dockerfile.path(), request.graph.marshal()).await?;

        let output_spec = export_output_spec(&request.image_ref, &request.labels, tar_path);
        let mut args: Vec<String> = vec![
            "buildx".into(),
            "build".into(),
            "--file".into(),
            dockerfile.path().to_string_lossy().into_owned(),
            "--platform".into(),
            request.graph.base.platform.format(),
            "--progress".into(),
            "plain".into(),
            "--output".into(),
            output_spec,
        ];
        if let Some(builder) = builder {
            args.push("--builder".into());
            args.push(builder.to_string());
        }
        if request.graph.base.pull == PullPolicy::Always {
            args.push("--pull".into());
        }
        if request.no_cache {
            args.push("--no-cache".into());
        } else {
            for spec in &request.cache_from {
                parse_cache_spec(spec)?;
                args.push("--cache-from".into());
                args.push(spec.clone());
            }
            for spec in &request.cache_to {
                parse_cache_spec(spec)?;
                args.push("--cache-to".into());
                args.push(spec.clone());
            }
        }
        args.push(request.context_dir.to_string_lossy().into_owned());

        info!(image_ref = %request.image_ref, platform = %request.graph.base.platform, "starting build");
        self.stream_build(&args, cancel).await?;

        verify_export_tar(tar_path).await?;
        self.store.load(tar_path, cancel).await?;

        if let Some(alias) = &request.alias {
            if let Err(e) = self.store.tag(&request.image_ref, alias, cancel).await {
                if e.is_cancelled() {
                    return Err(e);
                }
                warn!(alias = %alias, error = %e, "failed to apply alias tag");
                notes.push(format!("alias {alias} not applied"));
            }
        }

        Ok(notes)
    }

    /// Run the solve, forwarding progress lines (vertex names and log
    /// output) until the stream closes.
    async fn stream_build(&self, args: &[String], cancel: &CancellationToken) -> Result<()> {
        let mut child = Command::new(self.docker_path())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let consumer = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "warpgate::build", "{}", redaction::redact(&line));
                }
            }
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "warpgate::build", "{}", redaction::redact(&line));
                }
            }
        });

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                consumer.abort();
                return Err(WarpgateError::Cancelled);
            }
            status = child.wait() => status?,
        };
        let _ = consumer.await;

        if !status.success() {
            return Err(WarpgateError::transport(format!(
                "build solve failed with status {status}"
            )));
        }
        Ok(())
    }

    async fn run_docker(
        &self,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<std::process::Output> {
        let child = Command::new(self.docker_path())
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

/// A docker-format export must carry a `manifest.json`; anything else
/// means the daemon produced a truncated or foreign archive.
async fn verify_export_tar(tar_path: &Path) -> Result<()> {
    let path = tar_path.to_path_buf();
    let found = tokio::task::spawn_blocking(move || -> Result<bool> {
        let file = std::fs::File::open(&path)?;
        let mut archive = tar::Archive::new(file);
        for entry in archive.entries()? {
            let entry = entry?;
            if entry.path()?.as_ref() == Path::new("manifest.json") {
                return Ok(true);
            }
        }
        Ok(false)
    })
    .await
    .map_err(|e| WarpgateError::internal(format!("tar scan task panicked: {e}")))??;

    if !found {
        return Err(WarpgateError::internal(format!(
            "export tarball {} carries no manifest.json",
            tar_path.display()
        )));
    }
    Ok(())
}

/// Per-build export tar under the system temp directory.
fn export_tar_path() -> PathBuf {
    std::env::temp_dir().join(format!("warpgate-image-{}.tar", Utc::now().timestamp()))
}

fn remove_file_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed export tar"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove export tar"),
    }
}

/// The docker exporter spec: one local tarball entry carrying the image
/// name and a `label:` attribute per label.
fn export_output_spec(
    image_ref: &str,
    labels: &indexmap::IndexMap<String, String>,
    tar_path: &Path,
) -> String {
    let mut spec = format!(
        "type=docker,dest={},name={}",
        tar_path.display(),
        image_ref
    );
    for (key, value) in labels {
        spec.push_str(&format!(",label:{key}={value}"));
    }
    spec
}

/// Parse a `type=registry,ref=...[,mode=...]` cache spec into its
/// attribute map. Both `type` and `ref` are required.
pub fn parse_cache_spec(spec: &str) -> Result<BTreeMap<String, String>> {
    let mut attrs = BTreeMap::new();
    for part in spec.split(',') {
        let (key, value) = part.split_once('=').ok_or_else(|| {
            WarpgateError::configuration(format!("malformed cache spec attribute {part:?}"))
        })?;
        attrs.insert(key.trim().to_string(), value.trim().to_string());
    }
    if !attrs.contains_key("type") || !attrs.contains_key("ref") {
        return Err(WarpgateError::configuration(format!(
            "cache spec {spec:?} needs both type and ref"
        )));
    }
    Ok(attrs)
}

/// `buildx_buildkit_mybuilder0` container → `mybuilder` builder name.
fn builder_name_from_container(container: &str) -> String {
    container
        .strip_prefix(BUILDKIT_CONTAINER_PREFIX)
        .unwrap_or(container)
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ImageDetails;

    struct NullStore;

    #[async_trait::async_trait]
    impl ImageStore for NullStore {
        async fn load(&self, _: &Path, _: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn tag(&self, _: &str, _: &str, _: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn inspect(&self, _: &str, _: &CancellationToken) -> Result<ImageDetails> {
            Ok(ImageDetails::default())
        }
        async fn push(&self, _: &str, _: &CancellationToken) -> Result<String> {
            Ok(String::new())
        }
        async fn remove(&self, _: &str, _: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn explicit_tcp_endpoint_resolves() {
        let executor = BuildExecutor::new(
            BuilderConfig {
                endpoint: Some("tcp://10.0.0.1:1234".to_string()),
                ..Default::default()
            },
            Arc::new(NullStore),
        );
        let cancel = CancellationToken::new();
        let endpoint = executor.resolve_endpoint(&cancel).await.unwrap();
        assert_eq!(
            endpoint,
            BuilderEndpoint::Tcp {
                address: "tcp://10.0.0.1:1234".to_string()
            }
        );
    }

    #[tokio::test]
    async fn named_endpoint_resolves() {
        let executor = BuildExecutor::new(
            BuilderConfig {
                endpoint: Some("mybuilder".to_string()),
                ..Default::default()
            },
            Arc::new(NullStore),
        );
        let cancel = CancellationToken::new();
        assert_eq!(
            executor.resolve_endpoint(&cancel).await.unwrap(),
            BuilderEndpoint::Named("mybuilder".to_string())
        );
    }

    #[test]
    fn cache_spec_parsing() {
        let attrs = parse_cache_spec("type=registry,ref=ghcr.io/o/cache:latest,mode=max").unwrap();
        assert_eq!(attrs["type"], "registry");
        assert_eq!(attrs["ref"], "ghcr.io/o/cache:latest");
        assert_eq!(attrs["mode"], "max");
        assert!(parse_cache_spec("type=registry").is_err());
        assert!(parse_cache_spec("garbage").is_err());
    }

    #[test]
    fn builder_name_derivation() {
        assert_eq!(
            builder_name_from_container("buildx_buildkit_mybuilder0"),
            "mybuilder"
        );
        assert_eq!(builder_name_from_container("other"), "other");
    }

    #[test]
    fn output_spec_carries_name_and_labels() {
        let mut labels = indexmap::IndexMap::new();
        labels.insert("team".to_string(), "red".to_string());
        let spec = export_output_spec(
            "attack-box:1.0.0",
            &labels,
            Path::new("/tmp/warpgate-image-1.tar"),
        );
        assert_eq!(
            spec,
            "type=docker,dest=/tmp/warpgate-image-1.tar,name=attack-box:1.0.0,label:team=red"
        );
    }

    #[tokio::test]
    async fn export_tar_verification() {
        let dir = tempfile::TempDir::new().unwrap();
        let good = dir.path().join("good.tar");
        {
            let mut builder = tar::Builder::new(std::fs::File::create(&good).unwrap());
            let data = b"[]";
            let mut header = tar::Header::new_gnu();
            header.set_path("manifest.json").unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, data.as_slice()).unwrap();
            builder.finish().unwrap();
        }
        assert!(verify_export_tar(&good).await.is_ok());

        let empty = dir.path().join("empty.tar");
        {
            let builder = tar::Builder::new(std::fs::File::create(&empty).unwrap());
            builder.into_inner().unwrap();
        }
        assert!(verify_export_tar(&empty).await.is_err());
    }

    #[test]
    fn export_tar_uses_recognizable_name() {
        let path = export_tar_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("warpgate-image-"));
        assert!(name.ends_with(".tar"));
    }
}
