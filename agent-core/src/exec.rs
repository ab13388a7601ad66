//! Thin wrapper over external command invocation. Backends shell out to
//! their native tooling (`nmcli`, `networkctl`, `wicked`, `ip`, ...);
//! everything runs through here so output capture and logging are uniform.
//!
//! Children are killed when the owning future is dropped, which ties
//! command lifetime to the caller's cancellation context.
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct Output {
    /// exit code, -1 when terminated by signal
    pub status: i32,
    /// stdout, lossily decoded
    pub stdout: String,
    /// stderr, lossily decoded
    pub stderr: String,
}

impl Output {
    /// did the command exit 0
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Run `cmd` with `args`, capturing output. Errors only when the command
/// could not be spawned; a non-zero exit is reported in [`Output::status`].
pub async fn run<S: AsRef<str>>(cmd: &str, args: &[S]) -> Result<Output> {
    let args: Vec<&str> = args.iter().map(|s| s.as_ref()).collect();
    debug!(cmd, ?args, "exec");
    let out = Command::new(cmd)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to spawn {cmd}"))?;
    Ok(Output {
        status: out.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
}

/// Like [`run`] but a non-zero exit is an error carrying stderr
pub async fn run_ok<S: AsRef<str>>(cmd: &str, args: &[S]) -> Result<Output> {
    let out = run(cmd, args).await?;
    if !out.success() {
        anyhow::bail!(
            "{cmd} exited {}: {}",
            out.status,
            out.stderr.trim().to_owned() + out.stdout.trim()
        );
    }
    Ok(out)
}

/// Resolve `bin` against PATH. `None` means the tool is not installed,
/// which backends treat as "not managing" rather than an error.
pub fn lookup_path(bin: &str) -> Option<PathBuf> {
    if bin.contains('/') {
        let p = Path::new(bin);
        return is_executable(p).then(|| p.to_path_buf());
    }
    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(bin))
            .find(|p| is_executable(p))
    })
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_status() {
        let out = run("sh", &["-c", "echo hi; exit 3"]).await.unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout.trim(), "hi");
        assert!(run_ok("sh", &["-c", "exit 3"]).await.is_err());
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        assert!(run::<&str>("/nonexistent/binary", &[]).await.is_err());
    }

    #[test]
    fn path_lookup() {
        assert!(lookup_path("sh").is_some());
        assert!(lookup_path("definitely-not-a-real-tool-xyz").is_none());
    }
}
