//! Path expansion and context-relative conversion
//!
//! Template paths may carry `~` and environment references. Everything the
//! build graph touches is expanded here first, then expressed relative to
//! the computed build-context root.

use crate::errors::{Result, WarpgateError};
use std::env;
use std::path::{Path, PathBuf};

/// Expand a leading `~` and any `$VAR` / `${VAR}` occurrences, then make the
/// path absolute against the current directory.
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = expand_env(&expand_home(raw));
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = env::current_dir()?;
        Ok(cwd.join(path))
    }
}

fn expand_home(raw: &str) -> String {
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    raw.to_string()
}

/// Replace `$VAR` and `${VAR}` with values from the process environment.
/// Unset variables expand to the empty string.
fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                out.push_str(&env::var(&name).unwrap_or_default());
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Express `path` relative to the build-context `root`.
pub fn relative_to_context(path: &Path, root: &Path) -> Result<PathBuf> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| {
            WarpgateError::configuration(format!(
                "path {} lies outside the build context {}",
                path.display(),
                root.display()
            ))
        })
}
