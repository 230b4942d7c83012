//! Template data model
//!
//! The declarative input to the pipeline: base image, provisioning steps,
//! targets, and post-build changes. Loading and validation live outside the
//! core; this module defines the shape once so the tagged unions are
//! rejected at parse time rather than skipped at apply time.

use crate::errors::{Result, WarpgateError};
use crate::platform::Platform;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Declarative build template. Immutable once loaded; per-architecture
/// variants are produced with [`TemplateConfig::for_architecture`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfig {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub labels: IndexMap<String, String>,
    #[serde(default)]
    pub build_args: IndexMap<String, String>,
    /// Ordered set of target architectures (`amd64`, `arm64`, ...).
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub registry: Option<RegistryTarget>,
    #[serde(default)]
    pub no_cache: bool,
    pub base: BaseImage,
    #[serde(default)]
    pub provisioners: Vec<Provisioner>,
    /// Directive strings applied after all provisioners.
    #[serde(default)]
    pub post_changes: Vec<String>,
    #[serde(default)]
    pub arch_overrides: IndexMap<String, ArchOverride>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub targets: Vec<BuildTarget>,
}

/// Registry destination for pushed images and manifest lists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryTarget {
    pub host: String,
    #[serde(default)]
    pub namespace: String,
}

/// Base image the build starts from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseImage {
    pub image: String,
    /// `os/arch[/variant]`; defaults to `linux/<first architecture>`.
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub pull: PullPolicy,
    #[serde(default)]
    pub auth: Option<AuthSpec>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// Directive strings applied before any provisioner.
    #[serde(default)]
    pub changes: Vec<String>,
}

/// When to pull the base image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfMissing,
}

/// Inline credentials for a registry or git host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
}

/// A provisioning step. Closed sum: unknown tags fail deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Provisioner {
    /// Inline shell commands, joined and run under `sh -c`.
    #[serde(rename_all = "camelCase")]
    Shell {
        commands: Vec<String>,
        #[serde(default)]
        env: IndexMap<String, String>,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(flatten)]
        filter: RunFilter,
    },
    /// Copy a file from the build context into the image.
    #[serde(rename_all = "camelCase")]
    File {
        source: String,
        destination: String,
        #[serde(default)]
        mode: Option<String>,
        #[serde(flatten)]
        filter: RunFilter,
    },
    /// Run an Ansible playbook inside the image.
    #[serde(rename_all = "camelCase")]
    Ansible {
        playbook: String,
        #[serde(default)]
        galaxy_file: Option<String>,
        #[serde(default)]
        extra_vars: IndexMap<String, String>,
        #[serde(default)]
        inventory: Option<String>,
        #[serde(flatten)]
        filter: RunFilter,
    },
    /// Execute a list of scripts from the build context.
    #[serde(rename_all = "camelCase")]
    Script {
        scripts: Vec<String>,
        #[serde(flatten)]
        filter: RunFilter,
    },
}

impl Provisioner {
    pub fn filter(&self) -> &RunFilter {
        match self {
            Provisioner::Shell { filter, .. } => filter,
            Provisioner::File { filter, .. } => filter,
            Provisioner::Ansible { filter, .. } => filter,
            Provisioner::Script { filter, .. } => filter,
        }
    }
}

/// `only` / `except` filters over the build tag (e.g. `docker.amd64`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFilter {
    #[serde(default)]
    pub only: Vec<String>,
    #[serde(default)]
    pub except: Vec<String>,
}

impl RunFilter {
    /// Whether a provisioner carrying this filter runs for `build_tag`.
    /// `only` wins over `except` when both are present.
    pub fn applies_to(&self, build_tag: &str) -> bool {
        if !self.only.is_empty() {
            return self.only.iter().any(|t| t == build_tag);
        }
        !self.except.iter().any(|t| t == build_tag)
    }
}

/// External source repository referenced by provisioners
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub name: String,
    #[serde(default)]
    pub git: Option<GitSource>,
    /// Absolute staging location, assigned by the fetcher. Empty until then.
    #[serde(skip)]
    pub path: String,
}

/// Git descriptor for an external source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub repository: String,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub auth: Option<GitAuth>,
}

/// Git authentication material, first non-empty field wins:
/// ssh key file, inline ssh key, token, then username/password.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitAuth {
    #[serde(default)]
    pub ssh_key_path: String,
    #[serde(default)]
    pub ssh_key: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub token_username: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// A build target: which platforms it covers and whether to push
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTarget {
    #[serde(default)]
    pub name: String,
    pub platforms: Vec<String>,
    #[serde(default)]
    pub push: bool,
}

/// Per-architecture template override
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchOverride {
    #[serde(default)]
    pub base: Option<BaseImage>,
    #[serde(default)]
    pub provisioners: Vec<Provisioner>,
    /// Append to the template's provisioners instead of replacing them.
    #[serde(default)]
    pub append_provisioners: bool,
}

impl TemplateConfig {
    /// Clone the template for one architecture: apply any matching override,
    /// then pin the build platform to `linux/<arch>`.
    pub fn for_architecture(&self, arch: &str) -> TemplateConfig {
        let mut config = self.clone();
        if let Some(override_) = self.arch_overrides.get(arch) {
            if let Some(base) = &override_.base {
                config.base = base.clone();
            }
            if !override_.provisioners.is_empty() {
                if override_.append_provisioners {
                    config
                        .provisioners
                        .extend(override_.provisioners.iter().cloned());
                } else {
                    config.provisioners = override_.provisioners.clone();
                }
            }
        }
        config
    }

    /// The platform one architecture builds for.
    pub fn platform_for(&self, arch: &str) -> Result<Platform> {
        match &self.base.platform {
            Some(raw) => Platform::parse(raw),
            None => Ok(Platform::linux(arch)),
        }
    }

    /// The image tag every per-arch build shares: `<name>:<version>`.
    pub fn image_tag(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }

    /// Platform for compilation when no architecture was selected yet:
    /// `base.platform` if set, else `linux/<architectures[0]>`.
    pub fn default_platform(&self) -> Result<Platform> {
        if let Some(raw) = &self.base.platform {
            return Platform::parse(raw);
        }
        let arch = self.architectures.first().ok_or_else(|| {
            WarpgateError::configuration("template lists no architectures and no base platform")
        })?;
        Ok(Platform::linux(arch))
    }
}
