//! Package managers and the platform orchestrator built on them

mod core;
mod outcome;
mod platform;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::ContentCache;
use crate::config::{DownloadConfig, Settings};
use crate::download::Downloader;
use crate::error::{PackageResult, RegistryError};
use crate::platform::DescriptorPlatformFactory;
use crate::registry::HttpRegistryClient;

pub use self::core::{PackageManager, Prepared, StagedPackage};
pub use outcome::{
    DependencyReport, DependencyStatus, DependencyUninstall, InstallOutcome, PlatformInstall,
    PlatformUninstall, PlatformUpdate, RetainReason, RetainedPackage, UpdateOutcome,
};
pub use platform::{InstallOptions, PlatformManager};

/// Shared HTTP client for registry queries and downloads.
///
/// The read timeout applies between received chunks, so large archives are
/// not cut off while data keeps arriving.
pub fn http_client(config: &DownloadConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("embedpm/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(config.timeout())
        .read_timeout(config.timeout())
        .build()
}

/// Open the content cache, falling back to an in-memory one when the
/// database cannot be opened
pub fn open_content_cache(settings: &Settings) -> PackageResult<ContentCache> {
    let path = settings.cache_db_path();
    if let Some(parent) = path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!("Cannot create cache directory {:?}: {}", parent, e);
    }
    let cache = match ContentCache::new(&path) {
        Ok(cache) => cache,
        Err(e) => {
            warn!("Content cache at {:?} unavailable, using memory: {}", path, e);
            ContentCache::in_memory()?
        }
    };
    match cache.purge_expired() {
        Ok(0) => {}
        Ok(purged) => debug!("Purged {} expired cache entries", purged),
        Err(e) => warn!("Failed to purge expired cache entries: {}", e),
    }
    Ok(cache)
}

impl PlatformManager {
    /// Wire the managers with the HTTP registry, download cache and
    /// descriptor-based platforms
    pub fn from_settings(settings: &Settings) -> PackageResult<Self> {
        let client = http_client(&settings.download).map_err(RegistryError::Network)?;
        let cache = Arc::new(open_content_cache(settings)?);
        let registry = Arc::new(HttpRegistryClient::new(
            client.clone(),
            &settings.registry_url,
            cache,
        ));
        let downloader = Arc::new(Downloader::new(
            client,
            settings.download_dir(),
            settings.download.clone(),
        ));
        Self::new(
            settings,
            registry,
            downloader,
            Arc::new(DescriptorPlatformFactory),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(temp_dir: &TempDir) -> Settings {
        Settings {
            core_dir: temp_dir.path().to_path_buf(),
            engine_version: "2.5.0".to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn from_settings_creates_cache_database() {
        let temp_dir = TempDir::new().unwrap();
        let settings = settings(&temp_dir);

        let manager = PlatformManager::from_settings(&settings).unwrap();

        assert_eq!(manager.engine_version().to_string(), "2.5.0");
        assert!(settings.cache_db_path().is_file());
        assert!(manager.platforms().list().unwrap().is_empty());
    }

    #[test]
    fn open_content_cache_falls_back_to_memory() {
        let temp_dir = TempDir::new().unwrap();
        // a file where the cache directory should be
        std::fs::write(temp_dir.path().join(".cache"), "").unwrap();

        let cache = open_content_cache(&settings(&temp_dir));

        assert!(cache.is_ok());
    }
}
