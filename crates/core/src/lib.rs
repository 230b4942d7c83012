//! Core library for the warpgate image build orchestrator
//!
//! Turns declarative templates into per-architecture container images:
//! build-graph compilation, BuildKit execution, source fetching, local
//! image-store handling, and multi-arch manifest assembly against OCI
//! registries.

pub mod context;
pub mod errors;
pub mod executor;
pub mod gitconfig;
pub mod graph;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod paths;
pub mod platform;
pub mod redaction;
pub mod reference;
pub mod registry;
pub mod sources;
pub mod store;
pub mod template;

// Re-export IndexMap for dependent crates (ordered maps keep template
// iteration deterministic).
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
