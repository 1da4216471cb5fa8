//! Git checkouts for version-control package sources

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::DownloadError;

/// A shallow checkout with its metadata removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsCheckout {
    pub short_commit: String,
}

impl VcsCheckout {
    /// Version recorded for packages installed from a repository
    pub fn version(&self) -> String {
        format!("0.0.0+sha.{}", self.short_commit)
    }
}

/// Clone `url` at `reference` into `dest`, which must not exist yet
pub async fn checkout(
    url: &str,
    reference: Option<&str>,
    dest: &Path,
) -> Result<VcsCheckout, DownloadError> {
    let locator = match reference {
        Some(reference) => format!("{}#{}", url, reference),
        None => url.to_string(),
    };
    let fail = |message: String| DownloadError::Vcs {
        locator: locator.clone(),
        message,
    };

    let mut clone = Command::new("git");
    clone.args(["clone", "--depth", "1", "--quiet"]);
    if let Some(reference) = reference {
        clone.args(["--branch", reference]);
    }
    clone.arg(url).arg(dest);

    if run(&mut clone).await.is_err() {
        // `--branch` only accepts branches and tags; a commit needs a full clone
        let Some(reference) = reference else {
            return Err(fail("git clone failed".to_string()));
        };
        debug!("Shallow clone of {} failed, retrying with full history", locator);
        if dest.exists() {
            std::fs::remove_dir_all(dest)?;
        }
        run(Command::new("git").args(["clone", "--quiet", url]).arg(dest))
            .await
            .map_err(&fail)?;
        run(Command::new("git")
            .arg("-C")
            .arg(dest)
            .args(["checkout", "--quiet", reference]))
        .await
        .map_err(&fail)?;
    }

    let short_commit = run(Command::new("git")
        .arg("-C")
        .arg(dest)
        .args(["rev-parse", "--short", "HEAD"]))
    .await
    .map_err(&fail)?;

    std::fs::remove_dir_all(dest.join(".git"))?;
    info!("Checked out {} at {}", locator, short_commit);
    Ok(VcsCheckout { short_commit })
}

/// Run a git command, returning trimmed stdout or stderr on failure
async fn run(command: &mut Command) -> Result<String, String> {
    let output = command
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .map_err(|e| format!("failed to run git: {}", e))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}
