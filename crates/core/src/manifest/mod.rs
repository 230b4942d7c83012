//! Multi-architecture manifest handling
//!
//! Digest-file bookkeeping, index assembly and publication, and manifest
//! inspection.

pub mod assembler;
pub mod digest_file;
pub mod inspector;

pub use assembler::{AssembledIndex, ManifestAssembler, ManifestEntry, ManifestOptions};
pub use digest_file::{
    discover_digest_files, filter_by_required, parse_digest_file, validate_digest_files,
    write_digest_file, DigestFile,
};
pub use inspector::{ArchitectureInfo, ManifestInfo, ManifestInspector};
