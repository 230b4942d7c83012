//! Git clone and ref resolution
//!
//! Clones external source repositories with libgit2. The requested ref is
//! tried as a branch name first; when that clone fails the repository is
//! cloned at its default branch and the ref resolved as, in order, a full
//! commit hash, a branch name, a tag name. Authentication material is
//! selected from the source's descriptor and never logged.

use crate::errors::{Result, WarpgateError};
use crate::redaction;
use crate::template::GitAuth;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, ErrorCode, FetchOptions, RemoteCallbacks, Repository};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default username when a token is sent as HTTP basic auth
const TOKEN_USERNAME: &str = "x-access-token";

/// One clone request
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub url: String,
    pub reference: Option<String>,
    pub depth: Option<u32>,
    pub auth: Option<GitAuth>,
}

/// Clone `request.url` into `dest`, resolving the requested ref.
///
/// libgit2 is synchronous, so the work runs on the blocking pool; the
/// cancellation token aborts the transfer at the next progress callback.
pub async fn clone_source(
    request: CloneRequest,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(WarpgateError::Cancelled);
    }
    register_secrets(request.auth.as_ref());

    let dest = dest.to_path_buf();
    let cancel = cancel.clone();
    let url = request.url.clone();
    let result = tokio::task::spawn_blocking(move || clone_blocking(&request, &dest, &cancel))
        .await
        .map_err(|e| WarpgateError::internal(format!("clone task panicked: {e}")))?;

    result.map_err(|e| classify_git_error(&url, e))
}

fn clone_blocking(
    request: &CloneRequest,
    dest: &Path,
    cancel: &CancellationToken,
) -> std::result::Result<(), GitFailure> {
    match &request.reference {
        None => {
            clone_with(request, dest, cancel, None)?;
            Ok(())
        }
        Some(reference) => {
            // Branch name first; the common case needs one round trip.
            match clone_with(request, dest, cancel, Some(reference.as_str())) {
                Ok(_) => Ok(()),
                Err(e) if is_reference_not_found(&e) => {
                    clean_dest(dest);
                    let repo = clone_with(request, dest, cancel, None)?;
                    checkout_ref(&repo, reference)
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Failures inside the blocking section: either a libgit2 error or an
/// explicit cancellation surfaced through the progress callback.
#[derive(Debug)]
enum GitFailure {
    Git(git2::Error),
    Cancelled,
    RefNotFound(String),
}

impl From<git2::Error> for GitFailure {
    fn from(e: git2::Error) -> Self {
        GitFailure::Git(e)
    }
}

fn is_reference_not_found(failure: &GitFailure) -> bool {
    match failure {
        GitFailure::Git(e) => e.code() == ErrorCode::NotFound || {
            let message = e.message().to_ascii_lowercase();
            message.contains("reference") && message.contains("not found")
        },
        GitFailure::RefNotFound(_) => true,
        GitFailure::Cancelled => false,
    }
}

/// A failed branch clone can leave a partial checkout behind; the retry
/// needs an empty destination.
fn clean_dest(dest: &Path) {
    if dest.exists() {
        let _ = std::fs::remove_dir_all(dest);
    }
}

fn clone_with(
    request: &CloneRequest,
    dest: &Path,
    cancel: &CancellationToken,
    branch: Option<&str>,
) -> std::result::Result<Repository, GitFailure> {
    let mut callbacks = RemoteCallbacks::new();
    let auth = request.auth.clone();
    callbacks.credentials(move |_url, username_from_url, _allowed| {
        credentials_for(auth.as_ref(), username_from_url)
    });
    let cancel_probe = cancel.clone();
    callbacks.transfer_progress(move |_progress| !cancel_probe.is_cancelled());

    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(callbacks);
    if let Some(depth) = request.depth {
        fetch.depth(depth as i32);
    }

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch);
    if let Some(branch) = branch {
        builder.branch(branch);
    }

    match builder.clone(&request.url, dest) {
        Ok(repo) => Ok(repo),
        Err(e) if cancel.is_cancelled() => {
            debug!(error = %e, "clone aborted by cancellation");
            Err(GitFailure::Cancelled)
        }
        Err(e) => Err(GitFailure::Git(e)),
    }
}

/// Select credentials, first non-empty material wins: SSH key file, inline
/// SSH key, token as basic auth, username/password, anonymous default.
fn credentials_for(
    auth: Option<&GitAuth>,
    username_from_url: Option<&str>,
) -> std::result::Result<Cred, git2::Error> {
    let ssh_user = username_from_url.unwrap_or("git");
    let Some(auth) = auth else {
        return Cred::default();
    };

    if !auth.ssh_key_path.is_empty() {
        return Cred::ssh_key(ssh_user, None, Path::new(&auth.ssh_key_path), None);
    }
    if !auth.ssh_key.is_empty() {
        return Cred::ssh_key_from_memory(ssh_user, None, &auth.ssh_key, None);
    }
    if !auth.token.is_empty() {
        let username = if auth.token_username.is_empty() {
            TOKEN_USERNAME
        } else {
            &auth.token_username
        };
        return Cred::userpass_plaintext(username, &auth.token);
    }
    if !auth.username.is_empty() && !auth.password.is_empty() {
        return Cred::userpass_plaintext(&auth.username, &auth.password);
    }
    Cred::default()
}

fn register_secrets(auth: Option<&GitAuth>) {
    if let Some(auth) = auth {
        redaction::add_global_secret(&auth.token);
        redaction::add_global_secret(&auth.password);
        redaction::add_global_secret(&auth.ssh_key);
    }
}

/// Peel to a commit and move both the working tree and a detached HEAD
/// onto it.
fn checkout_detached(
    repo: &Repository,
    object: &git2::Object<'_>,
) -> std::result::Result<(), GitFailure> {
    let commit = object.peel_to_commit()?;
    let mut opts = CheckoutBuilder::new();
    opts.force();
    repo.checkout_tree(commit.as_object(), Some(&mut opts))?;
    repo.set_head_detached(commit.id())?;
    Ok(())
}

/// Resolve a ref in the already-cloned repository, strictly in the order
/// full commit hash, branch name, tag name. The order matters: a name
/// that exists as more than one ref kind resolves to the earlier kind.
fn checkout_ref(repo: &Repository, reference: &str) -> std::result::Result<(), GitFailure> {
    // Full commit hash
    if let Ok(oid) = git2::Oid::from_str(reference) {
        if let Ok(commit) = repo.find_commit(oid) {
            return checkout_detached(repo, commit.as_object());
        }
    }

    // Branch (local, then the remote-tracking ref a fresh clone has)
    for candidate in [
        format!("refs/heads/{reference}"),
        format!("refs/remotes/origin/{reference}"),
    ] {
        if let Ok(object) = repo.revparse_single(&candidate) {
            return checkout_detached(repo, &object);
        }
    }

    // Tag
    if let Ok(object) = repo.revparse_single(&format!("refs/tags/{reference}")) {
        return checkout_detached(repo, &object);
    }

    Err(GitFailure::RefNotFound(reference.to_string()))
}

fn classify_git_error(url: &str, failure: GitFailure) -> WarpgateError {
    match failure {
        GitFailure::Cancelled => WarpgateError::Cancelled,
        GitFailure::RefNotFound(reference) => WarpgateError::resolution(
            format!("ref {reference:?} in {url}"),
            "not a commit hash, branch, or tag",
        ),
        GitFailure::Git(e) => {
            let message = redaction::redact(e.message());
            match e.class() {
                git2::ErrorClass::Http | git2::ErrorClass::Ssh
                    if e.code() == ErrorCode::Auth =>
                {
                    WarpgateError::authentication(url.to_string(), message)
                }
                git2::ErrorClass::Net => WarpgateError::transport(format!(
                    "git transport failure for {url}: {message}"
                )),
                _ => WarpgateError::resolution(url.to_string(), message),
            }
        }
    }
}
