//! Platform identifiers
//!
//! A platform is the `os/arch[/variant]` triple used by registries and the
//! build daemon. Architecture labels on digest files use `-` instead of `/`
//! (`arm-v7`), so this module also handles that decomposition.

use crate::errors::{Result, WarpgateError};
use serde::{Deserialize, Serialize};

/// An `os/arch[/variant]` platform triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// The default platform for an architecture: `linux/<arch>`.
    pub fn linux(architecture: impl Into<String>) -> Self {
        Self {
            os: "linux".to_string(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    /// Parse `os/arch` or `os/arch/variant`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(WarpgateError::resolution(
                "platform",
                format!("invalid platform format: {s:?}"),
            )),
        }
    }

    /// Render as `os/arch[/variant]`. Inverse of [`Platform::parse`].
    pub fn format(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}/{}/{}", self.os, self.architecture, variant),
            None => format!("{}/{}", self.os, self.architecture),
        }
    }

    /// The architecture label as it appears in digest file names:
    /// `arm-v7` for arch `arm` variant `v7`, otherwise just the arch.
    pub fn arch_label(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}-{}", self.architecture, variant),
            None => self.architecture.clone(),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// Split an architecture label into `(architecture, variant)`.
///
/// `arm-v7` becomes `("arm", Some("v7"))`; labels without a `-` have no
/// variant.
pub fn split_arch_label(label: &str) -> (String, Option<String>) {
    match label.split_once('-') {
        Some((arch, variant)) if !arch.is_empty() && !variant.is_empty() => {
            (arch.to_string(), Some(variant.to_string()))
        }
        _ => (label.to_string(), None),
    }
}
