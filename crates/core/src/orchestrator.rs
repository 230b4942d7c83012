//! Build orchestration
//!
//! Fans a template out over its architectures: apply overrides, pin the
//! platform, compile, execute, and collect results. Partial failure is
//! surfaced as an aggregate error listing failed architectures in order;
//! best-effort callers get whatever succeeded.

use crate::context;
use crate::errors::{FailedItem, Result, WarpgateError};
use crate::executor::{BuildExecutor, BuildRequest, BuilderConfig, BuildResult};
use crate::gitconfig;
use crate::graph;
use crate::reference;
use crate::store::ImageStore;
use crate::template::TemplateConfig;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Options shaping one orchestrated run
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Keep going when an architecture fails; the aggregate error is
    /// downgraded to a warning and successful results are returned.
    pub best_effort: bool,
    /// Registry cache import specs (`type=registry,ref=...`).
    pub cache_from: Vec<String>,
    /// Registry cache export specs.
    pub cache_to: Vec<String>,
    /// Where to record digest files for later manifest assembly.
    pub digest_dir: Option<PathBuf>,
    /// How many architectures build concurrently.
    pub concurrency: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            best_effort: false,
            cache_from: Vec::new(),
            cache_to: Vec::new(),
            digest_dir: None,
            concurrency: 2,
        }
    }
}

/// Drives per-architecture builds for one template
pub struct BuildOrchestrator {
    builder: BuilderConfig,
    store: Arc<dyn ImageStore>,
    options: BuildOptions,
}

impl BuildOrchestrator {
    pub fn new(builder: BuilderConfig, store: Arc<dyn ImageStore>, options: BuildOptions) -> Self {
        Self {
            builder,
            store,
            options,
        }
    }

    /// Build the template for every architecture it lists. An empty
    /// architecture list yields zero results, not an error.
    pub async fn build_all(
        &self,
        config: &TemplateConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<BuildResult>> {
        if config.architectures.is_empty() {
            info!("template lists no architectures, nothing to build");
            return Ok(Vec::new());
        }

        let author = gitconfig::read_default_identity().author();
        let total = config.architectures.len();
        let concurrency = self.options.concurrency.max(1);

        // `buffered` keeps results in architecture order, which keeps
        // aggregate error reporting deterministic.
        let results: Vec<(String, Result<BuildResult>)> =
            stream::iter(config.architectures.iter().cloned())
                .map(|arch| {
                    let author = author.clone();
                    async move {
                        let result = self.build_one(config, &arch, &author, cancel).await;
                        (arch, result)
                    }
                })
                .buffered(concurrency)
                .collect()
                .await;

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (arch, result) in results {
            match result {
                Ok(build) => successes.push(build),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => failures.push(FailedItem {
                    item: arch,
                    reason: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            let aggregate = WarpgateError::PartialFailure { total, failures };
            if self.options.best_effort {
                warn!(error = %aggregate, "continuing despite failed architectures");
            } else {
                return Err(aggregate);
            }
        }

        self.push_targets(config, &mut successes, cancel).await?;

        if let Some(digest_dir) = &self.options.digest_dir {
            for build in &successes {
                if build.digest.is_empty() {
                    warn!(architecture = %build.architecture, "no digest to record");
                    continue;
                }
                if let Err(e) = crate::manifest::digest_file::write_digest_file(
                    digest_dir,
                    &config.name,
                    &build.architecture,
                    &build.digest,
                ) {
                    warn!(architecture = %build.architecture, error = %e, "failed to record digest file");
                }
            }
        }

        Ok(successes)
    }

    /// Push per-arch images whose platform is covered by a target with the
    /// push flag. The registry-assigned digest replaces the local one on
    /// the build result so digest files reference what the registry holds.
    async fn push_targets(
        &self,
        config: &TemplateConfig,
        results: &mut [crate::executor::BuildResult],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(registry) = &config.registry else {
            return Ok(());
        };
        for result in results.iter_mut() {
            let covered = config.targets.iter().any(|target| {
                target.push
                    && target
                        .platforms
                        .iter()
                        .any(|platform| platform == &result.platform)
            });
            if !covered {
                continue;
            }
            let push_ref = reference::arch_image_ref(
                &registry.host,
                &registry.namespace,
                &config.name,
                &result.architecture,
                &config.version,
            );
            let pushed = self.store.push(&push_ref, cancel).await?;
            info!(image_ref = %push_ref, digest = %pushed, "pushed per-arch image");
            if !pushed.is_empty() {
                result.digest = pushed;
            }
            result.notes.push(format!("pushed {push_ref}"));
        }
        Ok(())
    }

    async fn build_one(
        &self,
        config: &TemplateConfig,
        arch: &str,
        author: &str,
        cancel: &CancellationToken,
    ) -> Result<BuildResult> {
        let mut arch_config = config.for_architecture(arch);
        arch_config.base.platform = Some(format!("linux/{arch}"));
        let tag = arch_config.image_tag();

        // Base-image credentials go straight into the redaction registry;
        // they must never surface in progress output.
        if let Some(auth) = &arch_config.base.auth {
            crate::redaction::add_global_secret(&auth.password);
            crate::redaction::add_global_secret(&auth.token);
        }

        let context_dir = context::plan_context(&arch_config)?;
        let graph = graph::compile(&arch_config, &context_dir, author)?;

        let alias = arch_config.registry.as_ref().map(|registry| {
            reference::arch_image_ref(
                &registry.host,
                &registry.namespace,
                &arch_config.name,
                arch,
                &arch_config.version,
            )
        });

        let request = BuildRequest {
            graph,
            context_dir,
            image_ref: tag,
            alias,
            labels: arch_config.labels.clone(),
            cache_from: self.options.cache_from.clone(),
            cache_to: self.options.cache_to.clone(),
            no_cache: arch_config.no_cache,
        };

        // Each architecture gets its own executor; nothing is shared
        // across concurrent builds.
        let executor = BuildExecutor::new(self.builder.clone(), Arc::clone(&self.store));
        executor.build(&request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CliImageStore, ImageDetails, ImageStore};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_architectures_build_nothing() {
        let config: TemplateConfig = serde_json::from_str(
            r#"{"name": "x", "version": "1", "base": {"image": "alpine"}}"#,
        )
        .unwrap();
        let store: Arc<dyn ImageStore> = Arc::new(CliImageStore::new());
        let orchestrator =
            BuildOrchestrator::new(BuilderConfig::default(), store, BuildOptions::default());
        let cancel = CancellationToken::new();
        let results = orchestrator.build_all(&config, &cancel).await.unwrap();
        assert!(results.is_empty());
    }

    #[derive(Default)]
    struct RecordingStore {
        pushed: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ImageStore for RecordingStore {
        async fn load(&self, _: &Path, _: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn tag(&self, _: &str, _: &str, _: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn inspect(&self, _: &str, _: &CancellationToken) -> Result<ImageDetails> {
            Ok(ImageDetails::default())
        }
        async fn push(&self, image_ref: &str, _: &CancellationToken) -> Result<String> {
            self.pushed.lock().unwrap().push(image_ref.to_string());
            Ok("sha256:pushed".to_string())
        }
        async fn remove(&self, _: &str, _: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn push_targets_pushes_covered_platforms() {
        let config: TemplateConfig = serde_json::from_str(
            r#"{
                "name": "attack-box", "version": "1.0.0",
                "architectures": ["amd64", "arm64"],
                "registry": {"host": "ghcr.io", "namespace": "cowdogmoo"},
                "base": {"image": "alpine"},
                "targets": [{"platforms": ["linux/amd64"], "push": true}]
            }"#,
        )
        .unwrap();

        let store = Arc::new(RecordingStore::default());
        let orchestrator = BuildOrchestrator::new(
            BuilderConfig::default(),
            Arc::clone(&store) as Arc<dyn ImageStore>,
            BuildOptions::default(),
        );

        let mut results = vec![
            BuildResult {
                image_ref: "attack-box:1.0.0".to_string(),
                digest: "sha256:local".to_string(),
                platform: "linux/amd64".to_string(),
                architecture: "amd64".to_string(),
                duration: Duration::from_secs(1),
                notes: vec![],
            },
            BuildResult {
                image_ref: "attack-box:1.0.0".to_string(),
                digest: "sha256:local".to_string(),
                platform: "linux/arm64".to_string(),
                architecture: "arm64".to_string(),
                duration: Duration::from_secs(1),
                notes: vec![],
            },
        ];

        let cancel = CancellationToken::new();
        orchestrator
            .push_targets(&config, &mut results, &cancel)
            .await
            .unwrap();

        let pushed = store.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0], "ghcr.io/cowdogmoo/attack-box-amd64:1.0.0");
        drop(pushed);
        // The pushed arch picked up the registry digest; the other kept
        // its local digest.
        assert_eq!(results[0].digest, "sha256:pushed");
        assert_eq!(results[1].digest, "sha256:local");
    }
}
