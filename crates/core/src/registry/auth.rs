//! Registry credential resolution
//!
//! Resolves `(username, secret)` pairs per registry host. Precedence:
//! a token configured for the host, then the `REGISTRY_USERNAME` /
//! `REGISTRY_PASSWORD` environment pair, then a Docker credential helper,
//! then the Docker config file, then anonymous. Resolution never fails:
//! anything unreadable degrades to anonymous so the caller can retry
//! unauthenticated.

use crate::redaction;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Username used when a bare token stands in for basic auth
pub const TOKEN_USERNAME: &str = "x-access-token";

/// Resolved credentials for one registry host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl Credentials {
    /// Create an Authorization header value
    pub fn to_auth_header(&self) -> Option<String> {
        match self {
            Credentials::Anonymous => None,
            Credentials::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                Some(format!("Basic {encoded}"))
            }
            Credentials::Bearer { token } => Some(format!("Bearer {token}")),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credentials::Anonymous)
    }
}

/// Per-host credential lookup backed by configured tokens, credential
/// helpers, and the Docker config file
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    /// Explicitly configured tokens, keyed by registry host.
    tokens: HashMap<String, String>,
    /// Username to pair with configured tokens; defaults to
    /// [`TOKEN_USERNAME`].
    token_username: Option<String>,
    /// Override for the Docker config path (tests use this).
    docker_config_path: Option<PathBuf>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure a token for one registry host.
    pub fn with_token(mut self, host: impl Into<String>, token: impl Into<String>) -> Self {
        let token = token.into();
        redaction::add_global_secret(&token);
        self.tokens.insert(host.into(), token);
        self
    }

    /// Pair configured tokens with a username other than the default.
    pub fn with_token_username(mut self, username: impl Into<String>) -> Self {
        self.token_username = Some(username.into());
        self
    }

    /// Point at a specific Docker config file instead of the default.
    pub fn with_docker_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.docker_config_path = Some(path.into());
        self
    }

    /// Resolve credentials for a registry host. Never fails; unresolvable
    /// hosts get [`Credentials::Anonymous`].
    pub fn resolve(&self, host: &str) -> Credentials {
        if let Some(token) = self.tokens.get(host) {
            let username = self
                .token_username
                .clone()
                .unwrap_or_else(|| TOKEN_USERNAME.to_string());
            return Credentials::Basic {
                username,
                password: token.clone(),
            };
        }

        if let (Ok(username), Ok(password)) =
            (env::var("REGISTRY_USERNAME"), env::var("REGISTRY_PASSWORD"))
        {
            if !username.is_empty() && !password.is_empty() {
                debug!(host, "using credentials from environment");
                redaction::add_global_secret(&password);
                return Credentials::Basic { username, password };
            }
        }

        let Some(config) = self.load_docker_config() else {
            return Credentials::Anonymous;
        };

        if let Some(helper) = config.helper_for(host) {
            match run_credential_helper(&helper, host) {
                Ok(Some(credentials)) => return credentials,
                Ok(None) => {}
                Err(e) => {
                    debug!(host, helper, error = %e, "credential helper lookup failed");
                }
            }
        }

        if let Some(entry) = config.auths.get(host) {
            if let Some(credentials) = entry.to_credentials() {
                debug!(host, "using credentials from docker config");
                return credentials;
            }
        }

        Credentials::Anonymous
    }

    fn load_docker_config(&self) -> Option<DockerConfig> {
        let path = match &self.docker_config_path {
            Some(path) => path.clone(),
            None => default_docker_config_path()?,
        };
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<DockerConfig>(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable docker config, treating as absent");
                None
            }
        }
    }
}

fn default_docker_config_path() -> Option<PathBuf> {
    if let Ok(dir) = env::var("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
}

/// Docker config file structure (the slice this crate reads)
#[derive(Debug, Deserialize, Default)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerConfigAuth>,
    #[serde(rename = "credHelpers", default)]
    cred_helpers: HashMap<String, String>,
    #[serde(rename = "credsStore", default)]
    creds_store: Option<String>,
}

impl DockerConfig {
    fn helper_for(&self, host: &str) -> Option<String> {
        self.cred_helpers
            .get(host)
            .cloned()
            .or_else(|| self.creds_store.clone())
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfigAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl DockerConfigAuth {
    fn to_credentials(&self) -> Option<Credentials> {
        if let Some(auth) = &self.auth {
            let decoded = base64::engine::general_purpose::STANDARD.decode(auth).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (username, password) = decoded.split_once(':')?;
            redaction::add_global_secret(password);
            return Some(Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            redaction::add_global_secret(password);
            return Some(Credentials::Basic {
                username: username.clone(),
                password: password.clone(),
            });
        }
        None
    }
}

/// Ask `docker-credential-<helper> get` for the host's credentials.
fn run_credential_helper(
    helper: &str,
    host: &str,
) -> std::io::Result<Option<Credentials>> {
    let mut child = Command::new(format!("docker-credential-{helper}"))
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(host.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Ok(None);
    }

    #[derive(Deserialize)]
    struct HelperOutput {
        #[serde(rename = "Username", default)]
        username: String,
        #[serde(rename = "Secret", default)]
        secret: String,
    }

    let parsed: HelperOutput = match serde_json::from_slice(&output.stdout) {
        Ok(parsed) => parsed,
        Err(_) => return Ok(None),
    };
    if parsed.secret.is_empty() {
        return Ok(None);
    }
    redaction::add_global_secret(&parsed.secret);
    let username = if parsed.username.is_empty() {
        TOKEN_USERNAME.to_string()
    } else {
        parsed.username
    };
    Ok(Some(Credentials::Basic {
        username,
        password: parsed.secret,
    }))
}
