//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the system `git` binary.
//! Upstream-facing operations (`clone_mirror`, `fetch_all`) take a
//! [`GitOptions`] carrying `-c` configuration for the user-agent and
//! credential header, never touch the terminal, and kill the child when the
//! caller's deadline drops the future. Mirror-facing operations
//! (`advertise_refs`, `upload_pack_stream`) implement the serving half of
//! the smart-HTTP protocol.

use std::path::Path;
use std::process::Stdio;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, instrument, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git {op} failed (status {status}): {stderr}")]
    Failed {
        op: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("failed to capture {0} of git upload-pack")]
    Stdio(&'static str),
}

impl GitError {
    /// The child's stderr, when the command ran and exited non-zero.
    pub fn stderr(&self) -> &str {
        match self {
            GitError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// Extra `git -c` configuration applied to upstream operations.
#[derive(Debug, Clone, Default)]
pub struct GitOptions {
    /// `key=value` pairs passed as `-c key=value`.
    pub config: Vec<String>,
}

// ---------------------------------------------------------------------------
// Upstream operations
// ---------------------------------------------------------------------------

fn upstream_command(opts: &GitOptions) -> Command {
    let mut cmd = Command::new("git");
    for kv in &opts.config {
        cmd.arg("-c").arg(kv);
    }
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

/// Run `git clone --mirror <url> <dest>`, bringing every upstream ref into
/// a fresh bare repository.
#[instrument(skip(opts), fields(%url, dest = %dest.display()))]
pub async fn clone_mirror(url: &str, dest: &Path, opts: &GitOptions) -> Result<(), GitError> {
    let mut cmd = upstream_command(opts);
    cmd.arg("clone").arg("--mirror").arg(url).arg(dest);
    run_checked(cmd, "clone --mirror").await
}

/// Run `git fetch --prune --force <url> "+refs/*:refs/*"` inside an
/// existing bare mirror, updating all refs.
#[instrument(skip(opts), fields(repo = %repo.display(), %url))]
pub async fn fetch_all(repo: &Path, url: &str, opts: &GitOptions) -> Result<(), GitError> {
    let mut cmd = upstream_command(opts);
    cmd.arg("-C")
        .arg(repo)
        .arg("fetch")
        .arg("--prune")
        .arg("--force")
        .arg(url)
        .arg("+refs/*:refs/*");
    run_checked(cmd, "fetch").await
}

async fn run_checked(mut cmd: Command, op: &'static str) -> Result<(), GitError> {
    debug!(op, "spawning git");
    let output = cmd.output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(GitError::Failed {
            op,
            status: output.status,
            stderr,
        });
    }
    debug!(op, "git succeeded");
    Ok(())
}

// ---------------------------------------------------------------------------
// Serving operations
// ---------------------------------------------------------------------------

/// pkt-line service announcement prepended to a smart-HTTP ref
/// advertisement: a length-prefixed `# service=<name>` line followed by a
/// flush packet.
pub fn service_announcement(service: &str) -> Vec<u8> {
    let payload = format!("# service={service}\n");
    let mut out = format!("{:04x}", payload.len() + 4).into_bytes();
    out.extend_from_slice(payload.as_bytes());
    out.extend_from_slice(b"0000");
    out
}

/// Produce the ref advertisement for a bare mirror via
/// `git upload-pack --stateless-rpc --advertise-refs`.
///
/// The client's `Git-Protocol` header is forwarded through `GIT_PROTOCOL`
/// so protocol-v2 capability advertisements work end to end.
#[instrument(fields(repo = %repo.display()))]
pub async fn advertise_refs(repo: &Path, git_protocol: Option<&str>) -> Result<Vec<u8>, GitError> {
    let mut cmd = Command::new("git");
    cmd.arg("upload-pack")
        .arg("--stateless-rpc")
        .arg("--advertise-refs")
        .arg(repo);
    if let Some(proto) = git_protocol {
        cmd.env("GIT_PROTOCOL", proto);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd.output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(GitError::Failed {
            op: "upload-pack --advertise-refs",
            status: output.status,
            stderr,
        });
    }
    Ok(output.stdout)
}

/// Spawn `git upload-pack --stateless-rpc` against a bare mirror, feed it
/// `request_body`, and return its stdout as a byte stream.
///
/// The child is reaped on a background task once the stream drains so no
/// zombie processes accumulate.
#[instrument(skip(request_body), fields(repo = %repo.display(), body_len = request_body.len()))]
pub async fn upload_pack_stream(
    repo: &Path,
    request_body: Bytes,
    git_protocol: Option<&str>,
) -> Result<ReaderStream<tokio::process::ChildStdout>, GitError> {
    let mut cmd = Command::new("git");
    cmd.arg("upload-pack").arg("--stateless-rpc").arg(repo);
    if let Some(proto) = git_protocol {
        cmd.env("GIT_PROTOCOL", proto);
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    // Feed the request concurrently with reading the response; upload-pack
    // may start writing before it has consumed all input.
    let mut stdin = child.stdin.take().ok_or(GitError::Stdio("stdin"))?;
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(&request_body).await {
            warn!(error = %e, "short write to git upload-pack stdin");
        }
        // stdin drops here, signalling EOF.
    });

    let stdout = child.stdout.take().ok_or(GitError::Stdio("stdout"))?;

    // Reap the child in the background so we don't leak processes.
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if !status.success() => {
                warn!(%status, "git upload-pack exited with non-zero status");
            }
            Err(e) => {
                error!(error = %e, "failed to wait on git upload-pack");
            }
            _ => {}
        }
    });

    Ok(ReaderStream::new(stdout))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_is_length_prefixed() {
        assert_eq!(
            service_announcement("git-upload-pack"),
            b"001e# service=git-upload-pack\n0000",
        );
    }

    #[test]
    fn announcement_length_tracks_service_name() {
        let out = service_announcement("git-receive-pack");
        assert!(out.starts_with(b"001f# service=git-receive-pack\n"));
        assert!(out.ends_with(b"0000"));
    }

    #[tokio::test]
    async fn clone_from_invalid_url_reports_stderr() {
        if std::process::Command::new("git").arg("--version").output().is_err() {
            eprintln!("git not found in PATH; skipping");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("out.git");
        let err = clone_mirror("file:///nonexistent/repo", &dest, &GitOptions::default())
            .await
            .unwrap_err();
        assert!(!err.stderr().is_empty());
    }
}
