//! Build context planning
//!
//! The build daemon sees exactly one local directory. This module collects
//! every file path the template's provisioners reference, expands them, and
//! picks the deepest directory that contains them all. File-copy operations
//! in the build graph are then expressed relative to that root.

use crate::errors::Result;
use crate::paths;
use crate::template::{Provisioner, TemplateConfig};
use std::env;
use std::path::{Component, Path, PathBuf};

/// All file paths referenced by the template's provisioners, expanded and
/// absolute, in provisioner order.
pub fn referenced_paths(config: &TemplateConfig) -> Result<Vec<PathBuf>> {
    let mut paths_out = Vec::new();
    for provisioner in &config.provisioners {
        match provisioner {
            Provisioner::File { source, .. } => {
                paths_out.push(paths::expand_path(source)?);
            }
            Provisioner::Ansible {
                playbook,
                galaxy_file,
                inventory,
                ..
            } => {
                paths_out.push(paths::expand_path(playbook)?);
                if let Some(galaxy) = galaxy_file {
                    paths_out.push(paths::expand_path(galaxy)?);
                }
                if let Some(inventory) = inventory {
                    paths_out.push(paths::expand_path(inventory)?);
                }
            }
            Provisioner::Script { scripts, .. } => {
                for script in scripts {
                    paths_out.push(paths::expand_path(script)?);
                }
            }
            Provisioner::Shell { .. } => {}
        }
    }
    Ok(paths_out)
}

/// Compute the build-context root for a template: the deepest common
/// ancestor of every referenced path, or the current directory when
/// nothing is referenced.
pub fn plan_context(config: &TemplateConfig) -> Result<PathBuf> {
    let referenced = referenced_paths(config)?;
    if referenced.is_empty() {
        return Ok(env::current_dir()?);
    }
    Ok(common_ancestor(&referenced))
}

/// Deepest directory that is an ancestor of every path. Paths are treated
/// as files: when the common prefix is itself one of the inputs, its
/// parent is the context.
fn common_ancestor(paths: &[PathBuf]) -> PathBuf {
    let mut prefix: Vec<Component> = paths[0].components().collect();
    for path in &paths[1..] {
        let components: Vec<Component> = path.components().collect();
        let shared = prefix
            .iter()
            .zip(components.iter())
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(shared);
    }

    let candidate: PathBuf = prefix.iter().collect();
    if paths.iter().any(|p| p == &candidate) {
        candidate
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(candidate)
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_of_siblings() {
        let paths = vec![
            PathBuf::from("/work/files/motd"),
            PathBuf::from("/work/scripts/setup.sh"),
        ];
        assert_eq!(common_ancestor(&paths), PathBuf::from("/work"));
    }

    #[test]
    fn single_file_uses_parent() {
        let paths = vec![PathBuf::from("/work/playbooks/main.yml")];
        assert_eq!(common_ancestor(&paths), PathBuf::from("/work/playbooks"));
    }

    #[test]
    fn nested_paths_share_deepest_dir() {
        let paths = vec![
            PathBuf::from("/work/ansible/playbooks/main.yml"),
            PathBuf::from("/work/ansible/galaxy.yml"),
        ];
        assert_eq!(common_ancestor(&paths), PathBuf::from("/work/ansible"));
    }

    #[test]
    fn no_references_means_current_dir() {
        let config: TemplateConfig = serde_json::from_str(
            r#"{"name": "x", "version": "1", "base": {"image": "alpine"}}"#,
        )
        .unwrap();
        let context = plan_context(&config).unwrap();
        assert_eq!(context, env::current_dir().unwrap());
    }

    #[test]
    fn collects_paths_in_provisioner_order() {
        let config: TemplateConfig = serde_json::from_str(
            r#"{
                "name": "x", "version": "1",
                "base": {"image": "alpine"},
                "provisioners": [
                    {"type": "file", "source": "/work/files/motd", "destination": "/etc/motd"},
                    {"type": "script", "scripts": ["/work/scripts/a.sh", "/work/scripts/b.sh"]},
                    {"type": "shell", "commands": ["true"]}
                ]
            }"#,
        )
        .unwrap();
        let referenced = referenced_paths(&config).unwrap();
        assert_eq!(
            referenced,
            vec![
                PathBuf::from("/work/files/motd"),
                PathBuf::from("/work/scripts/a.sh"),
                PathBuf::from("/work/scripts/b.sh"),
            ]
        );
        assert_eq!(plan_context(&config).unwrap(), PathBuf::from("/work"));
    }
}
