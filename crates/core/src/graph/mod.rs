//! Build graph compilation
//!
//! Pure translation from a template into an ordered, layered sequence of
//! operations anchored by a base-image pull. Filesystem mutations (RUN,
//! COPY) and image-config mutations (ENV, USER, LABEL, ...) share one
//! sequence so directive ordering survives into the marshaled graph.

pub mod cache;
pub mod directive;
mod render;

use crate::errors::{Result, WarpgateError};
use crate::paths;
use crate::platform::Platform;
use crate::template::{Provisioner, PullPolicy, TemplateConfig};
use cache::CacheMount;
use directive::{parse_directive, Directive, TrackedEnv};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Label key for the image author pulled from the builder's git identity
pub const AUTHOR_LABEL: &str = "org.opencontainers.image.authors";

/// The base layer every graph starts from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseLayer {
    pub image: String,
    pub platform: Platform,
    pub pull: PullPolicy,
}

/// One operation in the layered build sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Shell execution with optional cache mounts.
    Run {
        command: String,
        mounts: Vec<CacheMount>,
    },
    /// Copy from the build context (context-relative source).
    Copy { source: PathBuf, destination: String },
    Env { key: String, value: String },
    Workdir(String),
    User(String),
    Label { key: String, value: String },
    Expose(String),
    Volume(String),
    /// Empty vector clears the entrypoint.
    Entrypoint(Vec<String>),
    /// Empty vector clears the command.
    Cmd(Vec<String>),
}

/// An ordered, layered build description for one platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildGraph {
    pub base: BaseLayer,
    pub ops: Vec<Operation>,
}

impl BuildGraph {
    /// Marshal to the build daemon's frontend format. Identical graphs
    /// marshal to byte-identical output.
    pub fn marshal(&self) -> String {
        render::render(self)
    }
}

/// Compile a template into a build graph.
///
/// `context_root` is the planned build-context directory; every referenced
/// file must resolve under it. `author` becomes an OCI author label when
/// non-empty.
pub fn compile(
    config: &TemplateConfig,
    context_root: &Path,
    author: &str,
) -> Result<BuildGraph> {
    let platform = config.default_platform()?;
    let build_tag = format!("docker.{}", platform.architecture);

    let base = BaseLayer {
        image: config.base.image.clone(),
        platform,
        pull: config.base.pull,
    };

    let mut compiler = Compiler {
        context_root,
        ops: Vec::new(),
        env: TrackedEnv::new(),
        current_user: "root".to_string(),
    };

    // Base environment and build args come first so every later layer
    // sees them.
    for (key, value) in &config.base.env {
        compiler.push_env(key.clone(), value.clone());
    }
    for (key, value) in &config.build_args {
        compiler.push_env(key.clone(), value.clone());
    }

    for line in &config.base.changes {
        compiler.apply_change(line);
    }

    for provisioner in &config.provisioners {
        if !provisioner.filter().applies_to(&build_tag) {
            debug!(tag = %build_tag, "provisioner filtered out");
            continue;
        }
        compiler.apply_provisioner(provisioner)?;
    }

    for line in &config.post_changes {
        compiler.apply_change(line);
    }

    for (key, value) in &config.labels {
        compiler.ops.push(Operation::Label {
            key: key.clone(),
            value: value.clone(),
        });
    }
    if !author.is_empty() {
        compiler.ops.push(Operation::Label {
            key: AUTHOR_LABEL.to_string(),
            value: author.to_string(),
        });
    }

    Ok(BuildGraph {
        base,
        ops: compiler.ops,
    })
}

struct Compiler<'a> {
    context_root: &'a Path,
    ops: Vec<Operation>,
    env: TrackedEnv,
    current_user: String,
}

impl Compiler<'_> {
    fn push_env(&mut self, key: String, value: String) {
        self.env.set(key.clone(), value.clone());
        self.ops.push(Operation::Env { key, value });
    }

    fn apply_change(&mut self, line: &str) {
        let Some(directive) = parse_directive(line, &mut self.env) else {
            return;
        };
        if let Directive::User(user) = &directive {
            self.current_user = user.clone();
        }
        self.ops.push(match directive {
            Directive::Env { key, value } => Operation::Env { key, value },
            Directive::Workdir(dir) => Operation::Workdir(dir),
            Directive::User(user) => Operation::User(user),
            Directive::Entrypoint(argv) => Operation::Entrypoint(argv),
            Directive::Cmd(argv) => Operation::Cmd(argv),
            Directive::Label { key, value } => Operation::Label { key, value },
            Directive::Expose(port) => Operation::Expose(port),
            Directive::Volume(path) => Operation::Volume(path),
        });
    }

    fn apply_provisioner(&mut self, provisioner: &Provisioner) -> Result<()> {
        match provisioner {
            Provisioner::Shell {
                commands,
                env,
                user,
                working_dir,
                ..
            } => {
                let mut parts = Vec::new();
                if let Some(dir) = working_dir {
                    parts.push(format!("cd {dir}"));
                }
                for (key, value) in env {
                    parts.push(format!("export {key}={value}"));
                }
                let joined = commands.join(" && ");
                let mounts = cache::cache_mounts_for(&joined);
                parts.push(joined);
                let command = parts.join(" && ");

                match user {
                    Some(user) if user != &self.current_user => {
                        let restore = self.current_user.clone();
                        self.ops.push(Operation::User(user.clone()));
                        self.ops.push(Operation::Run { command, mounts });
                        self.ops.push(Operation::User(restore));
                    }
                    _ => self.ops.push(Operation::Run { command, mounts }),
                }
                Ok(())
            }
            Provisioner::File {
                source,
                destination,
                mode,
                ..
            } => {
                let relative = self.context_relative(source)?;
                self.ops.push(Operation::Copy {
                    source: relative,
                    destination: destination.clone(),
                });
                if let Some(mode) = mode {
                    self.ops.push(Operation::Run {
                        command: format!("chmod {mode} {destination}"),
                        mounts: Vec::new(),
                    });
                }
                Ok(())
            }
            Provisioner::Script { scripts, .. } => {
                for script in scripts {
                    let absolute = paths::expand_path(script)?;
                    let name = absolute
                        .file_name()
                        .and_then(|n| n.to_str())
                        .ok_or_else(|| {
                            WarpgateError::configuration(format!(
                                "script path {script:?} has no file name"
                            ))
                        })?
                        .to_string();
                    let relative = self.context_relative(script)?;
                    let target = format!("/tmp/{name}");
                    self.ops.push(Operation::Copy {
                        source: relative,
                        destination: target.clone(),
                    });
                    self.ops.push(Operation::Run {
                        command: format!("chmod +x {target} && {target}"),
                        mounts: Vec::new(),
                    });
                }
                Ok(())
            }
            Provisioner::Ansible {
                playbook,
                galaxy_file,
                extra_vars,
                inventory,
                ..
            } => self.apply_ansible(playbook, galaxy_file.as_deref(), extra_vars, inventory.as_deref()),
        }
    }

    fn apply_ansible(
        &mut self,
        playbook: &str,
        galaxy_file: Option<&str>,
        extra_vars: &indexmap::IndexMap<String, String>,
        inventory: Option<&str>,
    ) -> Result<()> {
        let playbook_abs = paths::expand_path(playbook)?;
        let playbook_rel = self.context_relative(playbook)?;
        self.ops.push(Operation::Copy {
            source: playbook_rel,
            destination: "/tmp/playbook.yml".to_string(),
        });

        if let Some(collection_root) = find_collection_root(&playbook_abs) {
            let relative =
                paths::relative_to_context(&collection_root, self.context_root)?;
            self.ops.push(Operation::Copy {
                source: relative,
                destination: "/tmp/ansible-collection".to_string(),
            });
            self.ops.push(Operation::Run {
                command: "ansible-galaxy collection install /tmp/ansible-collection/ -p /usr/share/ansible/collections".to_string(),
                mounts: Vec::new(),
            });
        }

        if let Some(galaxy) = galaxy_file {
            let relative = self.context_relative(galaxy)?;
            self.ops.push(Operation::Copy {
                source: relative,
                destination: "/tmp/requirements.yml".to_string(),
            });
            self.ops.push(Operation::Run {
                command: "ansible-galaxy install -r /tmp/requirements.yml".to_string(),
                mounts: Vec::new(),
            });
        }

        let inventory_arg = match inventory {
            Some(inventory) => {
                let relative = self.context_relative(inventory)?;
                self.ops.push(Operation::Copy {
                    source: relative,
                    destination: "/tmp/inventory".to_string(),
                });
                "/tmp/inventory".to_string()
            }
            None => "localhost,".to_string(),
        };

        let mut command =
            format!("ansible-playbook /tmp/playbook.yml -i {inventory_arg} -c local");
        for (key, value) in extra_vars {
            command.push_str(&format!(" -e {key}={value}"));
        }
        self.ops.push(Operation::Run {
            command,
            mounts: cache::apt_cache_mounts(),
        });
        Ok(())
    }

    fn context_relative(&self, raw: &str) -> Result<PathBuf> {
        let absolute = paths::expand_path(raw)?;
        paths::relative_to_context(&absolute, self.context_root)
    }
}

/// Look for an Ansible collection root above a playbook. Only playbooks
/// organized under `playbooks/` or `roles/` are searched; the first
/// ancestor carrying a `galaxy.yml` wins.
fn find_collection_root(playbook_abs: &Path) -> Option<PathBuf> {
    let as_str = playbook_abs.to_string_lossy();
    if !as_str.contains("/playbooks/") && !as_str.contains("/roles/") {
        return None;
    }
    let mut dir = playbook_abs.parent();
    while let Some(current) = dir {
        if current.join("galaxy.yml").is_file() {
            return Some(current.to_path_buf());
        }
        dir = current.parent();
    }
    None
}
