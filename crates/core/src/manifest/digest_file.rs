//! Digest files
//!
//! On-disk records of prior single-arch builds, named
//! `digest-<image>-<arch>.txt` with a single `sha256:<64 hex>` line.
//! They decouple multi-arch manifest assembly from the build step.

use crate::errors::{Result, WarpgateError};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Architectures recognized when splitting `<image>-<arch>` file stems.
/// `arm-v7` style labels are matched as `<arch>-v<digit>` pairs.
const KNOWN_ARCHITECTURES: &[&str] = &[
    "amd64", "arm64", "arm", "386", "ppc64le", "s390x", "riscv64", "mips64le",
];

/// A parsed digest file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestFile {
    pub path: PathBuf,
    pub image_name: String,
    /// Architecture label as encoded in the name (`amd64`, `arm-v7`).
    pub architecture: String,
    pub digest: String,
    pub mod_time: DateTime<Utc>,
}

/// Parse one digest file: name shape, digest syntax, and algorithm.
pub fn parse_digest_file(path: &Path) -> Result<DigestFile> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| WarpgateError::resolution(path.display().to_string(), "no file name"))?;

    let stem = file_name
        .strip_prefix("digest-")
        .and_then(|rest| rest.strip_suffix(".txt"))
        .ok_or_else(|| {
            WarpgateError::resolution(
                file_name.to_string(),
                "digest files are named digest-<image>-<arch>.txt",
            )
        })?;

    let (image_name, architecture) = split_image_and_arch(stem).ok_or_else(|| {
        WarpgateError::resolution(
            file_name.to_string(),
            "file stem carries no architecture suffix",
        )
    })?;

    let content = fs::read_to_string(path)?;
    let digest = parse_digest(content.trim(), path)?;

    let mod_time = fs::metadata(path)?
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(DigestFile {
        path: path.to_path_buf(),
        image_name,
        architecture,
        digest,
        mod_time,
    })
}

/// Split `attack-box-amd64` into (`attack-box`, `amd64`) and
/// `test-arm-v7` into (`test`, `arm-v7`): the last token must be a known
/// architecture, optionally preceded by its base arch for variant labels.
fn split_image_and_arch(stem: &str) -> Option<(String, String)> {
    let tokens: Vec<&str> = stem.split('-').collect();
    if tokens.len() < 2 {
        return None;
    }

    let last = tokens[tokens.len() - 1];

    // Variant suffix: <arch>-v<digit>, e.g. arm-v7.
    if tokens.len() >= 3
        && last.len() >= 2
        && last.starts_with('v')
        && last[1..].chars().all(|c| c.is_ascii_digit())
    {
        let arch = tokens[tokens.len() - 2];
        if KNOWN_ARCHITECTURES.contains(&arch) {
            let image = tokens[..tokens.len() - 2].join("-");
            return Some((image, format!("{arch}-{last}")));
        }
    }

    let image = tokens[..tokens.len() - 1].join("-");
    if image.is_empty() {
        return None;
    }
    Some((image, last.to_string()))
}

/// Validate `algo:hex` digest content; only sha256 with 64 lowercase hex
/// digits passes.
fn parse_digest(content: &str, path: &Path) -> Result<String> {
    let (algorithm, hex) = content.split_once(':').ok_or_else(|| {
        WarpgateError::resolution(
            path.display().to_string(),
            format!("content {content:?} is not an algorithm:hex digest"),
        )
    })?;
    if algorithm != "sha256" {
        return Err(WarpgateError::internal(format!(
            "digest file {} uses algorithm {algorithm:?}, expected sha256",
            path.display()
        )));
    }
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(WarpgateError::resolution(
            path.display().to_string(),
            "digest hex must be 64 lowercase hex digits",
        ));
    }
    Ok(content.to_string())
}

/// Scan a directory for this image's digest files, in file-name order.
pub fn discover_digest_files(dir: &Path, image_name: &str) -> Result<Vec<DigestFile>> {
    let prefix = format!("digest-{image_name}-");
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) || !name.ends_with(".txt") {
            continue;
        }
        match parse_digest_file(&entry.path()) {
            Ok(file) => found.push(file),
            Err(e) => {
                warn!(file = name, error = %e, "skipping unparseable digest file");
            }
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(dir = %dir.display(), count = found.len(), "discovered digest files");
    Ok(found)
}

/// Validate discovered files against the requested image and freshness
/// window.
pub fn validate_digest_files(
    files: &[DigestFile],
    image_name: &str,
    max_age: Option<Duration>,
) -> Result<()> {
    let now = Utc::now();
    for file in files {
        if file.image_name != image_name {
            return Err(WarpgateError::resolution(
                file.path.display().to_string(),
                format!(
                    "image name {:?} does not match requested {image_name:?}",
                    file.image_name
                ),
            ));
        }
        if !file.digest.starts_with("sha256:") {
            return Err(WarpgateError::internal(format!(
                "digest file {} passed parsing with a non-sha256 digest",
                file.path.display()
            )));
        }
        if let Some(max_age) = max_age {
            let age = now.signed_duration_since(file.mod_time);
            let limit = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
            if age > limit {
                return Err(WarpgateError::resolution(
                    file.path.display().to_string(),
                    format!("digest file is older than the allowed {max_age:?}"),
                ));
            }
        }
    }
    Ok(())
}

/// Filter by required architectures. Empty requirements keep everything;
/// duplicated architectures keep the newest file; missing requirements
/// fail unless `best_effort`.
pub fn filter_by_required(
    files: Vec<DigestFile>,
    required: &[String],
    best_effort: bool,
) -> Result<Vec<DigestFile>> {
    let mut kept: Vec<DigestFile> = Vec::new();
    for file in files {
        if !required.is_empty() && !required.iter().any(|arch| arch == &file.architecture) {
            continue;
        }
        match kept.iter_mut().find(|k| k.architecture == file.architecture) {
            Some(existing) => {
                warn!(architecture = %file.architecture, "duplicate digest file, keeping newest");
                if file.mod_time > existing.mod_time {
                    *existing = file;
                }
            }
            None => kept.push(file),
        }
    }

    let missing: Vec<String> = required
        .iter()
        .filter(|arch| !kept.iter().any(|file| &file.architecture == *arch))
        .cloned()
        .collect();
    if !missing.is_empty() {
        let message = format!("required architectures missing: {}", missing.join(", "));
        if best_effort {
            warn!("{message}, continuing");
        } else {
            return Err(WarpgateError::resolution("digest files", message));
        }
    }

    Ok(kept)
}

/// Record a build's digest for later assembly.
pub fn write_digest_file(
    dir: &Path,
    image_name: &str,
    architecture: &str,
    digest: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("digest-{image_name}-{architecture}.txt"));
    fs::write(&path, format!("{digest}\n"))?;
    debug!(path = %path.display(), "wrote digest file");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HEX: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parses_plain_architecture() {
        let dir = TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "digest-attack-box-amd64.txt",
            &format!("sha256:{HEX}\n"),
        );
        let file = parse_digest_file(&path).unwrap();
        assert_eq!(file.image_name, "attack-box");
        assert_eq!(file.architecture, "amd64");
        assert_eq!(file.digest, format!("sha256:{HEX}"));
    }

    #[test]
    fn parses_variant_architecture() {
        let dir = TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "digest-test-arm-v7.txt",
            &format!("sha256:{HEX}"),
        );
        let file = parse_digest_file(&path).unwrap();
        assert_eq!(file.image_name, "test");
        assert_eq!(file.architecture, "arm-v7");
    }

    #[test]
    fn rejects_invalid_content() {
        let dir = TempDir::new().unwrap();
        let path = write(dir.path(), "digest-x-amd64.txt", "not-a-valid-digest");
        assert!(parse_digest_file(&path).is_err());
    }

    #[test]
    fn non_sha256_algorithm_is_internal_error() {
        let dir = TempDir::new().unwrap();
        let path = write(dir.path(), "digest-x-amd64.txt", &format!("md5:{HEX}"));
        let err = parse_digest_file(&path).unwrap_err();
        assert!(matches!(err, WarpgateError::Internal { .. }));
    }

    #[test]
    fn rejects_short_hex() {
        let dir = TempDir::new().unwrap();
        let path = write(dir.path(), "digest-x-amd64.txt", "sha256:abc123");
        assert!(parse_digest_file(&path).is_err());
    }

    #[test]
    fn discovery_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "digest-box-arm64.txt",
            &format!("sha256:{HEX}"),
        );
        write(
            dir.path(),
            "digest-box-amd64.txt",
            &format!("sha256:{HEX}"),
        );
        write(
            dir.path(),
            "digest-other-amd64.txt",
            &format!("sha256:{HEX}"),
        );
        write(dir.path(), "unrelated.txt", "ignore me");

        let found = discover_digest_files(dir.path(), "box").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].architecture, "amd64");
        assert_eq!(found[1].architecture, "arm64");
    }

    #[test]
    fn validation_checks_image_name() {
        let dir = TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "digest-box-amd64.txt",
            &format!("sha256:{HEX}"),
        );
        let file = parse_digest_file(&path).unwrap();
        assert!(validate_digest_files(&[file.clone()], "box", None).is_ok());
        assert!(validate_digest_files(&[file], "other", None).is_err());
    }

    #[test]
    fn validation_enforces_max_age() {
        let dir = TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "digest-box-amd64.txt",
            &format!("sha256:{HEX}"),
        );
        let mut file = parse_digest_file(&path).unwrap();
        file.mod_time = Utc::now() - chrono::Duration::hours(48);
        assert!(
            validate_digest_files(&[file.clone()], "box", Some(Duration::from_secs(3600)))
                .is_err()
        );
        assert!(validate_digest_files(&[file], "box", None).is_ok());
    }

    #[test]
    fn filtering_by_required_architectures() {
        let dir = TempDir::new().unwrap();
        for arch in ["amd64", "arm64", "s390x"] {
            write(
                dir.path(),
                &format!("digest-box-{arch}.txt"),
                &format!("sha256:{HEX}"),
            );
        }
        let files = discover_digest_files(dir.path(), "box").unwrap();

        let all = filter_by_required(files.clone(), &[], false).unwrap();
        assert_eq!(all.len(), 3);

        let some = filter_by_required(
            files.clone(),
            &["amd64".to_string(), "arm64".to_string()],
            false,
        )
        .unwrap();
        assert_eq!(some.len(), 2);

        let missing = filter_by_required(
            files.clone(),
            &["amd64".to_string(), "mips64le".to_string()],
            false,
        );
        assert!(missing.is_err());

        let best_effort = filter_by_required(
            files,
            &["amd64".to_string(), "mips64le".to_string()],
            true,
        )
        .unwrap();
        assert_eq!(best_effort.len(), 1);
    }

    #[test]
    fn write_then_parse_round_trips() {
        let dir = TempDir::new().unwrap();
        let path =
            write_digest_file(dir.path(), "box", "arm-v7", &format!("sha256:{HEX}")).unwrap();
        let file = parse_digest_file(&path).unwrap();
        assert_eq!(file.image_name, "box");
        assert_eq!(file.architecture, "arm-v7");
    }
}
