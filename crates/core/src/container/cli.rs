//! Shared plumbing for CLI-driven engine adapters

use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Error, Result};

/// Run an engine CLI command to completion, capturing output.
///
/// Non-zero exit becomes a runtime error carrying the command line and
/// trimmed stderr.
pub(crate) async fn run_cli(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Runtime(format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Runtime(format!(
            "{} {} failed ({}): {}",
            program,
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a CLI command without failing on non-zero exit; returns whether
/// it succeeded
pub(crate) async fn cli_succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Start a created container attached, write `data` to its stdin, and
/// close the pipe.
///
/// Credential bytes travel only on the stdin pipe. The attached CLI
/// process is reaped in the background once the container exits.
pub(crate) async fn start_attached(program: &str, name: &str, data: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut child = Command::new(program)
        .args(["start", "--interactive", "--attach", name])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::Runtime(format!("failed to start '{}': {}", name, e)))?;

    let write_result = match child.stdin.take() {
        Some(mut stdin) => async {
            stdin.write_all(data).await?;
            stdin.shutdown().await
        }
        .await
        .map_err(|e| Error::Runtime(format!("credential injection failed: {}", e))),
        None => Err(Error::Runtime("stdin pipe unavailable".to_string())),
    };

    tokio::spawn(async move {
        let _ = child.wait().await;
    });
    write_result
}
