//! Git identity lookup
//!
//! Reads `user.name` / `user.email` from a gitconfig file to produce the
//! default image-author string. Follows `[include] path = ...` hops the way
//! git does, so identities split across included files still resolve.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Included files may themselves include others; bound the chase.
const MAX_INCLUDE_DEPTH: usize = 4;

/// `user.name` / `user.email` pair from a gitconfig
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl GitIdentity {
    /// Format as an image author string: `Name <email>`, degrading to
    /// whichever half is present, or empty when neither is set.
    pub fn author(&self) -> String {
        match (self.name.is_empty(), self.email.is_empty()) {
            (false, false) => format!("{} <{}>", self.name, self.email),
            (false, true) => self.name.clone(),
            (true, false) => self.email.clone(),
            (true, true) => String::new(),
        }
    }
}

/// Read the identity from the user's global gitconfig (`~/.gitconfig`).
pub fn read_default_identity() -> GitIdentity {
    match dirs::home_dir() {
        Some(home) => read_identity(&home.join(".gitconfig")),
        None => GitIdentity::default(),
    }
}

/// Read the identity from a specific gitconfig file. A missing or
/// unreadable file yields an empty identity, never an error: author
/// attribution is best-effort.
pub fn read_identity(path: &Path) -> GitIdentity {
    let mut identity = GitIdentity::default();
    parse_file(path, &mut identity, 0);
    identity
}

fn parse_file(path: &Path, identity: &mut GitIdentity, depth: usize) {
    if depth > MAX_INCLUDE_DEPTH {
        debug!(path = %path.display(), "gitconfig include depth exceeded");
        return;
    }
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };

    let mut section = String::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            section = line[1..line.len() - 1].trim().to_ascii_lowercase();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim().trim_matches('"').to_string();

        match (section.as_str(), key.as_str()) {
            ("user", "name") => identity.name = value,
            ("user", "email") => identity.email = value,
            ("include", "path") => {
                let include = resolve_include(path, &value);
                parse_file(&include, identity, depth + 1);
            }
            _ => {}
        }
    }
}

/// Include paths are relative to the file that names them; `~` points at
/// the home directory, as in git itself.
fn resolve_include(from: &Path, value: &str) -> PathBuf {
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let include = PathBuf::from(value);
    if include.is_absolute() {
        include
    } else {
        from.parent().unwrap_or(Path::new(".")).join(include)
    }
}
