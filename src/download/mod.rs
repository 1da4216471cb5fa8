//! Artifact fetching
//!
//! Remote archives are streamed into a temporary file next to the download
//! cache, verified and then renamed into the cache under a name derived from
//! URL and checksum, so repeated installs of the same artifact never touch
//! the network.

mod local;
mod vcs;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::error::DownloadError;

pub use local::copy_dir;
pub use vcs::{VcsCheckout, checkout};

/// Fetches remote artifacts into the download cache
pub struct Downloader {
    client: reqwest::Client,
    cache_dir: PathBuf,
    config: DownloadConfig,
}

/// Why a single attempt failed
enum AttemptError {
    Transient(String),
    Fatal(DownloadError),
}

impl Downloader {
    pub fn new(client: reqwest::Client, cache_dir: impl Into<PathBuf>, config: DownloadConfig) -> Self {
        Self {
            client,
            cache_dir: cache_dir.into(),
            config,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Fetch `url` into the download cache, verifying the sha256 digest when given
    pub async fn fetch(&self, url: &str, checksum: Option<&str>) -> Result<PathBuf, DownloadError> {
        let expected = checksum.map(normalize_checksum);
        let dest = self.cache_path(url, expected.as_deref());

        if dest.is_file() {
            match &expected {
                Some(expected) if &sha256_file(&dest)? != expected => {
                    warn!("Cached download {:?} is corrupt, fetching again", dest);
                    std::fs::remove_file(&dest)?;
                }
                _ => {
                    debug!("Using cached download for {}", url);
                    return Ok(dest);
                }
            }
        }

        self.download_into(url, expected, &dest).await
    }

    /// Fetch `url` again even when a cached copy exists, replacing it.
    ///
    /// Used for sources whose content may change behind the same URL.
    pub async fn refetch(&self, url: &str, checksum: Option<&str>) -> Result<PathBuf, DownloadError> {
        let expected = checksum.map(normalize_checksum);
        let dest = self.cache_path(url, expected.as_deref());
        debug!("Refreshing cached download for {}", url);
        self.download_into(url, expected, &dest).await
    }

    async fn download_into(
        &self,
        url: &str,
        expected: Option<String>,
        dest: &Path,
    ) -> Result<PathBuf, DownloadError> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let (tmp, actual) = self.download_with_retry(url).await?;

        if let Some(expected) = expected
            && actual != expected
        {
            // dropping the temporary file deletes it
            return Err(DownloadError::Integrity {
                url: url.to_string(),
                expected,
                actual,
            });
        }

        tmp.persist(dest).map_err(|e| DownloadError::Io(e.error))?;
        info!("Downloaded {} to {:?}", url, dest);
        Ok(dest.to_path_buf())
    }

    async fn download_with_retry(&self, url: &str) -> Result<(NamedTempFile, String), DownloadError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.download_once(url).await {
                Ok(result) => return Ok(result),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(message)) if attempt < max_attempts => {
                    let delay = backoff_delay(self.config.backoff_base_ms, attempt);
                    warn!(
                        "Attempt {}/{} for {} failed: {}; retrying in {:?}",
                        attempt, max_attempts, url, message, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Transient(message)) => {
                    return Err(DownloadError::TransientNetwork {
                        url: url.to_string(),
                        attempts: attempt,
                        message,
                    });
                }
            }
        }
    }

    async fn download_once(&self, url: &str) -> Result<(NamedTempFile, String), AttemptError> {
        let classify = |e: reqwest::Error| {
            if is_transient(&e) {
                AttemptError::Transient(e.to_string())
            } else {
                AttemptError::Fatal(DownloadError::Network {
                    url: url.to_string(),
                    source: e,
                })
            }
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(AttemptError::Fatal(DownloadError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            }));
        }

        let io_fatal = |e: std::io::Error| AttemptError::Fatal(DownloadError::Io(e));
        let mut tmp = NamedTempFile::new_in(&self.cache_dir).map_err(io_fatal)?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            hasher.update(&chunk);
            tmp.write_all(&chunk).map_err(io_fatal)?;
        }
        tmp.flush().map_err(io_fatal)?;

        Ok((tmp, hex::encode(hasher.finalize())))
    }

    /// Cache file for an artifact: digest of URL and checksum, keeping the
    /// archive extension so format detection by name still works
    fn cache_path(&self, url: &str, checksum: Option<&str>) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        hasher.update(checksum.unwrap_or_default().as_bytes());
        let digest = hex::encode(hasher.finalize());
        let file_name = match archive_extension(url) {
            Some(ext) => format!("{}{}", digest, ext),
            None => digest,
        };
        self.cache_dir.join(file_name)
    }
}

/// Lowercase hex digest without an algorithm prefix
pub fn normalize_checksum(checksum: &str) -> String {
    let checksum = checksum.trim();
    checksum
        .strip_prefix("sha256:")
        .unwrap_or(checksum)
        .to_ascii_lowercase()
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor))
}

fn archive_extension(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or_default().to_ascii_lowercase();
    [
        ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".tar", ".zip",
    ]
    .into_iter()
    .find(|ext| path.ends_with(ext))
}

/// Timeouts, dropped connections and interrupted bodies are worth retrying;
/// TLS, DNS and protocol failures are not
fn is_transient(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_body() {
        return true;
    }
    let mut source = std::error::Error::source(error);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Interrupted
            );
        }
        source = err.source();
    }
    false
}
