//! Change directives
//!
//! `changes` / `postChanges` entries are single-line directives in the
//! Dockerfile vocabulary: `ENV`, `WORKDIR`, `USER`, `ENTRYPOINT`, `CMD`,
//! `LABEL`, `EXPOSE`, `VOLUME`. Directives apply sequentially; `ENV` values
//! may reference earlier variables with unbraced `$NAME`.

use indexmap::IndexMap;
use tracing::warn;

/// Default PATH seeded into the tracked environment before any directive
/// runs.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A parsed change directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Env { key: String, value: String },
    Workdir(String),
    User(String),
    Entrypoint(Vec<String>),
    Cmd(Vec<String>),
    Label { key: String, value: String },
    Expose(String),
    Volume(String),
}

/// Environment map threaded through directive parsing so later `ENV`
/// entries see values set by earlier ones.
#[derive(Debug, Clone)]
pub struct TrackedEnv {
    values: IndexMap<String, String>,
}

impl Default for TrackedEnv {
    fn default() -> Self {
        let mut values = IndexMap::new();
        values.insert("PATH".to_string(), DEFAULT_PATH.to_string());
        Self { values }
    }
}

impl TrackedEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Expand unbraced `$NAME` references against the tracked map. Unknown
    /// names keep their literal `$NAME` text. `${NAME}` forms pass through
    /// untouched: the template loader expands those before the core sees
    /// them.
    pub fn expand(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut chars = value.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                Some('{') => {
                    // ${NAME} is pre-expanded upstream; emit verbatim.
                    out.push('$');
                }
                Some(c2) if c2.is_ascii_alphabetic() || *c2 == '_' => {
                    let mut name = String::new();
                    while let Some(c2) = chars.peek() {
                        if c2.is_ascii_alphanumeric() || *c2 == '_' {
                            name.push(*c2);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    match self.values.get(&name) {
                        Some(resolved) => out.push_str(resolved),
                        None => {
                            out.push('$');
                            out.push_str(&name);
                        }
                    }
                }
                _ => out.push('$'),
            }
        }
        out
    }
}

/// Parse one directive line, updating the tracked environment for `ENV`.
///
/// Lines with fewer than two whitespace-separated tokens are silently
/// ignored; unknown directive keywords warn and are skipped.
pub fn parse_directive(line: &str, env: &mut TrackedEnv) -> Option<Directive> {
    let trimmed = line.trim();
    let (keyword, rest) = trimmed.split_once(char::is_whitespace)?;
    let rest = rest.trim();
    if rest.is_empty() && !matches!(keyword.to_ascii_uppercase().as_str(), "ENTRYPOINT" | "CMD") {
        return None;
    }

    match keyword.to_ascii_uppercase().as_str() {
        "ENV" => {
            // Either `ENV K=V` or `ENV K V`.
            let (key, raw_value) = match rest.split_once('=') {
                Some((key, value)) if !key.contains(char::is_whitespace) => {
                    (key.to_string(), value.to_string())
                }
                _ => {
                    let (key, value) = rest.split_once(char::is_whitespace)?;
                    (key.to_string(), value.trim().to_string())
                }
            };
            let value = env.expand(&raw_value);
            env.set(key.clone(), value.clone());
            Some(Directive::Env { key, value })
        }
        "WORKDIR" => Some(Directive::Workdir(rest.to_string())),
        "USER" => Some(Directive::User(rest.to_string())),
        "ENTRYPOINT" => Some(Directive::Entrypoint(parse_exec_form(rest))),
        "CMD" => Some(Directive::Cmd(parse_exec_form(rest))),
        "LABEL" => {
            let (key, value) = rest.split_once('=')?;
            Some(Directive::Label {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            })
        }
        "EXPOSE" => Some(Directive::Expose(rest.to_string())),
        "VOLUME" => Some(Directive::Volume(rest.to_string())),
        other => {
            warn!(directive = other, "unknown change directive, skipping");
            None
        }
    }
}

/// `ENTRYPOINT` / `CMD` argument parsing: a JSON-array form has each
/// element trimmed of whitespace and quotes; anything else is a shell form
/// wrapped as `sh -c`. An empty value clears the setting.
fn parse_exec_form(value: &str) -> Vec<String> {
    let value = value.trim();
    if value.is_empty() {
        return Vec::new();
    }
    if value.starts_with('[') && value.ends_with(']') {
        let inner = &value[1..value.len() - 1];
        if inner.trim().is_empty() {
            return Vec::new();
        }
        return inner
            .split(',')
            .map(|element| element.trim().trim_matches('"').trim_matches('\'').to_string())
            .collect();
    }
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        value.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_equals_form() {
        let mut env = TrackedEnv::new();
        let directive = parse_directive("ENV APP_HOME=/opt/app", &mut env).unwrap();
        assert_eq!(
            directive,
            Directive::Env {
                key: "APP_HOME".to_string(),
                value: "/opt/app".to_string()
            }
        );
        assert_eq!(env.get("APP_HOME"), Some("/opt/app"));
    }

    #[test]
    fn env_space_form() {
        let mut env = TrackedEnv::new();
        let directive = parse_directive("ENV APP_HOME /opt/app", &mut env).unwrap();
        assert_eq!(
            directive,
            Directive::Env {
                key: "APP_HOME".to_string(),
                value: "/opt/app".to_string()
            }
        );
    }

    #[test]
    fn later_env_sees_earlier_values() {
        let mut env = TrackedEnv::new();
        parse_directive("ENV BASE=/opt", &mut env).unwrap();
        let directive = parse_directive("ENV APP=$BASE/app", &mut env).unwrap();
        assert_eq!(
            directive,
            Directive::Env {
                key: "APP".to_string(),
                value: "/opt/app".to_string()
            }
        );
    }

    #[test]
    fn unknown_variable_stays_literal() {
        let mut env = TrackedEnv::new();
        let directive = parse_directive("ENV K $A", &mut env).unwrap();
        assert_eq!(
            directive,
            Directive::Env {
                key: "K".to_string(),
                value: "$A".to_string()
            }
        );
    }

    #[test]
    fn braced_form_passes_through() {
        let mut env = TrackedEnv::new();
        env.set("A", "resolved");
        assert_eq!(env.expand("x${A}y"), "x${A}y");
    }

    #[test]
    fn path_is_seeded() {
        let mut env = TrackedEnv::new();
        let directive = parse_directive("ENV PATH $PATH:/opt/bin", &mut env).unwrap();
        assert_eq!(
            directive,
            Directive::Env {
                key: "PATH".to_string(),
                value: format!("{DEFAULT_PATH}:/opt/bin"),
            }
        );
    }

    #[test]
    fn entrypoint_json_array_form() {
        let mut env = TrackedEnv::new();
        let directive = parse_directive(r#"ENTRYPOINT ["/bin/app", "serve"]"#, &mut env).unwrap();
        assert_eq!(
            directive,
            Directive::Entrypoint(vec!["/bin/app".to_string(), "serve".to_string()])
        );
    }

    #[test]
    fn cmd_shell_form_wraps() {
        let mut env = TrackedEnv::new();
        let directive = parse_directive("CMD ./run --fast", &mut env).unwrap();
        assert_eq!(
            directive,
            Directive::Cmd(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "./run --fast".to_string()
            ])
        );
    }

    #[test]
    fn empty_entrypoint_clears() {
        let mut env = TrackedEnv::new();
        let directive = parse_directive("ENTRYPOINT []", &mut env).unwrap();
        assert_eq!(directive, Directive::Entrypoint(vec![]));
    }

    #[test]
    fn short_lines_are_ignored() {
        let mut env = TrackedEnv::new();
        assert_eq!(parse_directive("WORKDIR", &mut env), None);
        assert_eq!(parse_directive("", &mut env), None);
    }

    #[test]
    fn unknown_directive_is_skipped() {
        let mut env = TrackedEnv::new();
        assert_eq!(parse_directive("HEALTHCHECK CMD true", &mut env), None);
    }

    #[test]
    fn label_and_expose_and_volume() {
        let mut env = TrackedEnv::new();
        assert_eq!(
            parse_directive("LABEL org.opencontainers.image.title=box", &mut env),
            Some(Directive::Label {
                key: "org.opencontainers.image.title".to_string(),
                value: "box".to_string()
            })
        );
        assert_eq!(
            parse_directive("EXPOSE 8080", &mut env),
            Some(Directive::Expose("8080".to_string()))
        );
        assert_eq!(
            parse_directive("VOLUME /data", &mut env),
            Some(Directive::Volume("/data".to_string()))
        );
    }
}
