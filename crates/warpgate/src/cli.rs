//! Command-line surface
//!
//! Thin shell over warpgate-core: load the template, wire up options, and
//! dispatch. All build and manifest logic lives in the core crate.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warpgate_core::executor::BuilderConfig;
use warpgate_core::manifest::{ManifestAssembler, ManifestInspector, ManifestOptions};
use warpgate_core::orchestrator::{BuildOptions, BuildOrchestrator};
use warpgate_core::registry::{CredentialStore, RegistryClient};
use warpgate_core::sources;
use warpgate_core::store::CliImageStore;
use warpgate_core::template::TemplateConfig;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Multi-architecture container image build orchestrator"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the template's image for every listed architecture
    Build(BuildArgs),
    /// Create, inspect, or verify multi-arch manifests
    #[command(subcommand)]
    Manifest(ManifestCommands),
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Template file (YAML)
    template: PathBuf,

    /// Keep going when an architecture fails
    #[arg(long)]
    best_effort: bool,

    /// Build daemon endpoint (named builder or tcp:// address)
    #[arg(long)]
    builder: Option<String>,

    /// Registry cache import spec (repeatable)
    #[arg(long)]
    cache_from: Vec<String>,

    /// Registry cache export spec (repeatable)
    #[arg(long)]
    cache_to: Vec<String>,

    /// Directory to record digest files into
    #[arg(long)]
    digest_dir: Option<PathBuf>,

    /// Staging directory for fetched sources (kept after the build)
    #[arg(long)]
    staging_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum ManifestCommands {
    /// Assemble digest files into an index and push it
    Create(ManifestArgs),
    /// Verify per-arch images exist without pushing
    Verify(ManifestArgs),
    /// Show the platforms a manifest covers
    Inspect {
        /// Image reference
        image_ref: String,

        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct ManifestArgs {
    /// Registry host, e.g. ghcr.io
    #[arg(long)]
    registry: String,

    /// Registry namespace (optional)
    #[arg(long, default_value = "")]
    namespace: String,

    /// Image name
    #[arg(long)]
    image: String,

    /// Tag for the index and per-arch images
    #[arg(long, default_value = "latest")]
    tag: String,

    /// Required architectures (repeatable; empty keeps all discovered)
    #[arg(long = "arch")]
    architectures: Vec<String>,

    /// Tolerate missing required architectures
    #[arg(long)]
    best_effort: bool,

    /// Maximum digest file age in seconds
    #[arg(long)]
    max_age: Option<u64>,

    /// Skip registry verification before pushing
    #[arg(long)]
    no_verify: bool,

    /// Fail when a per-entry descriptor fetch fails instead of skipping
    #[arg(long)]
    strict: bool,

    /// Push an OCI image index instead of a Docker manifest list
    #[arg(long)]
    oci: bool,

    /// Directory holding digest files
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Registry token (paired with the x-access-token username)
    #[arg(long, env = "WARPGATE_REGISTRY_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl Cli {
    pub async fn dispatch(self, cancel: &CancellationToken) -> Result<()> {
        match self.command {
            Commands::Build(args) => run_build(args, cancel).await,
            Commands::Manifest(ManifestCommands::Create(args)) => {
                let (assembler, dir) = manifest_assembler(args)?;
                let assembled = assembler.assemble_from_dir(&dir, cancel).await?;
                println!("{}@{}", assembled.index_ref, assembled.digest);
                for entry in &assembled.entries {
                    println!("  {}  {}", entry.platform(), entry.digest);
                }
                Ok(())
            }
            Commands::Manifest(ManifestCommands::Verify(args)) => {
                let (assembler, dir) = manifest_assembler(args)?;
                let verified = assembler.verify_from_dir(&dir, cancel).await?;
                println!("verified {verified} image(s)");
                Ok(())
            }
            Commands::Manifest(ManifestCommands::Inspect { image_ref, json }) => {
                let client = RegistryClient::new(CredentialStore::new())?;
                let inspector = ManifestInspector::new(client);
                let info = inspector.inspect(&image_ref, cancel).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&info)?);
                    return Ok(());
                }
                println!("{}:{}  {}  {}", info.name, info.tag, info.media_type, info.digest);
                for arch in &info.architectures {
                    let variant = arch
                        .variant
                        .as_ref()
                        .map(|v| format!("/{v}"))
                        .unwrap_or_default();
                    println!(
                        "  {}/{}{}  {}  {} bytes",
                        arch.os, arch.architecture, variant, arch.digest, arch.size
                    );
                }
                Ok(())
            }
        }
    }
}

async fn run_build(args: BuildArgs, cancel: &CancellationToken) -> Result<()> {
    let raw = std::fs::read_to_string(&args.template)
        .with_context(|| format!("reading template {}", args.template.display()))?;
    let mut config: TemplateConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing template {}", args.template.display()))?;

    let cleanup = if config.sources.iter().any(|s| s.git.is_some()) {
        Some(
            sources::fetch_sources_with_cleanup(
                &args.template,
                &mut config.sources,
                args.staging_dir.clone(),
                cancel,
            )
            .await?,
        )
    } else {
        None
    };

    let builder = BuilderConfig {
        endpoint: args.builder.clone(),
        ..Default::default()
    };
    let options = BuildOptions {
        best_effort: args.best_effort,
        cache_from: args.cache_from.clone(),
        cache_to: args.cache_to.clone(),
        digest_dir: args.digest_dir.clone(),
        ..Default::default()
    };
    let orchestrator =
        BuildOrchestrator::new(builder, Arc::new(CliImageStore::new()), options);

    let outcome = orchestrator.build_all(&config, cancel).await;
    if let Some(cleanup) = cleanup {
        cleanup.run();
    }

    let results = outcome?;
    for result in &results {
        println!(
            "{}  {}  {}  ({:.1}s)",
            result.image_ref,
            result.platform,
            if result.digest.is_empty() {
                "<no digest>"
            } else {
                &result.digest
            },
            result.duration.as_secs_f64()
        );
        for note in &result.notes {
            println!("    note: {note}");
        }
    }
    Ok(())
}

fn manifest_assembler(args: ManifestArgs) -> Result<(ManifestAssembler, PathBuf)> {
    let mut credentials = CredentialStore::new();
    if let Some(token) = &args.token {
        credentials = credentials.with_token(args.registry.clone(), token.clone());
    }
    let client = RegistryClient::new(credentials)?;
    let options = ManifestOptions {
        registry: args.registry,
        namespace: args.namespace,
        image: args.image,
        tag: args.tag,
        required_architectures: args.architectures,
        best_effort: args.best_effort,
        max_age: args.max_age.map(std::time::Duration::from_secs),
        verify: !args.no_verify,
        strict_entries: args.strict,
        use_oci_index: args.oci,
    };
    Ok((ManifestAssembler::new(client, options), args.dir))
}
