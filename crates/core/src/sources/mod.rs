//! External source fetching
//!
//! Resolves the template's source repositories into a staging area the
//! build context can reference. Each source is cloned under
//! `<staging>/<name>/`, its absolute path written back into the source
//! descriptor. The staged trees are then copied next to the template
//! (`.warpgate-sources/`) so the build context stays stable after the
//! staging area is cleaned up.

pub mod copy;
pub mod git;

use crate::errors::{Result, WarpgateError};
use crate::template::Source;
use git::CloneRequest;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Temp staging directories carry this prefix so cleanup can tell its own
/// directories from caller-supplied ones.
pub const STAGING_PREFIX: &str = "warpgate-staging-";

/// Directory name for per-config staged source copies
pub const SOURCES_DIR: &str = ".warpgate-sources";

/// Fetches sources into a staging base directory
#[derive(Debug)]
pub struct SourceFetcher {
    staging_base: PathBuf,
}

impl SourceFetcher {
    /// Use a caller-provided staging base. The base is never deleted by
    /// cleanup.
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self {
            staging_base: base.into(),
        }
    }

    /// Create a temp staging base with the recognizable prefix.
    pub fn with_temp_base() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir()?
            .keep();
        Ok(Self { staging_base: dir })
    }

    pub fn staging_base(&self) -> &Path {
        &self.staging_base
    }

    /// Clone every source that has a git descriptor into
    /// `<staging>/<name>/`, writing the absolute path back into the
    /// source. Sources without a git descriptor are left untouched
    /// (`path` stays empty).
    pub async fn fetch(&self, sources: &mut [Source], cancel: &CancellationToken) -> Result<()> {
        for source in sources.iter_mut() {
            let Some(git) = source.git.clone() else {
                continue;
            };
            if source.name.is_empty() {
                return Err(WarpgateError::configuration(
                    "source with a git descriptor has no name",
                ));
            }

            let dest = self.staging_base.join(&source.name);
            tokio::fs::create_dir_all(&self.staging_base).await?;
            info!(name = %source.name, repository = %git.repository, "fetching source");

            git::clone_source(
                CloneRequest {
                    url: git.repository.clone(),
                    reference: git.reference.clone(),
                    depth: git.depth,
                    auth: git.auth.clone(),
                },
                &dest,
                cancel,
            )
            .await?;

            let absolute = tokio::fs::canonicalize(&dest).await?;
            source.path = absolute.to_string_lossy().into_owned();
            debug!(name = %source.name, path = %source.path, "source staged");
        }
        Ok(())
    }
}

/// Release handle for staged sources. Removal errors are logged and
/// swallowed; cleanup must compose under partial failure.
#[derive(Debug)]
pub struct SourceCleanup {
    staging_base: Option<PathBuf>,
    sources_dir: Option<PathBuf>,
}

impl SourceCleanup {
    /// Remove the staging base (only when it carries the recognizable
    /// prefix) and the per-config sources directory.
    pub fn run(self) {
        if let Some(base) = self.staging_base {
            let recognized = base
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(STAGING_PREFIX))
                .unwrap_or(false);
            if recognized {
                if let Err(e) = std::fs::remove_dir_all(&base) {
                    warn!(path = %base.display(), error = %e, "failed to remove staging dir");
                }
            } else {
                debug!(path = %base.display(), "staging base not ours, leaving in place");
            }
        }
        if let Some(dir) = self.sources_dir {
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!(path = %dir.display(), error = %e, "failed to remove sources dir");
                }
            }
        }
    }
}

/// Fetch all sources, stage a copy of each next to the template config,
/// and return the cleanup handle for everything created.
///
/// `base` overrides the temp staging directory; a caller-supplied base is
/// never deleted. On any error the cleanup runs before returning, so no
/// partial state leaks.
pub async fn fetch_sources_with_cleanup(
    config_path: &Path,
    sources: &mut [Source],
    base: Option<PathBuf>,
    cancel: &CancellationToken,
) -> Result<SourceCleanup> {
    let fetcher = match base {
        Some(base) => SourceFetcher::with_base(base),
        None => SourceFetcher::with_temp_base()?,
    };

    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let sources_dir = config_dir.join(SOURCES_DIR);

    let cleanup = SourceCleanup {
        staging_base: Some(fetcher.staging_base().to_path_buf()),
        sources_dir: Some(sources_dir.clone()),
    };

    match stage_sources(&fetcher, sources, &sources_dir, cancel).await {
        Ok(()) => Ok(cleanup),
        Err(e) => {
            cleanup.run();
            Err(e)
        }
    }
}

async fn stage_sources(
    fetcher: &SourceFetcher,
    sources: &mut [Source],
    sources_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    fetcher.fetch(sources, cancel).await?;

    for source in sources.iter_mut() {
        if source.path.is_empty() {
            continue;
        }
        let staged = PathBuf::from(&source.path);
        let dest = sources_dir.join(&source.name);
        copy::copy_dir(&staged, &dest, cancel).await?;
        let absolute = tokio::fs::canonicalize(&dest).await?;
        source.path = absolute.to_string_lossy().into_owned();
        debug!(name = %source.name, path = %source.path, "source copied next to config");
    }
    Ok(())
}
