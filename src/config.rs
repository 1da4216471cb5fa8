use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

// =============================================================================
// Time-related constants
// =============================================================================

/// How long derived views (board enumeration) are memoized within one run
pub const MEMO_TTL: Duration = Duration::from_secs(5);

/// Registry package metadata TTL (1 hour)
pub const PACKAGE_METADATA_TTL: Duration = Duration::from_secs(60 * 60);

/// Registered boards TTL (1 day)
pub const REGISTERED_BOARDS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// Store layout constants
// =============================================================================

/// File written into every committed package directory
pub const MANIFEST_FILE_NAME: &str = ".package.json";

/// Marker that protects a package from cascade uninstall and pruning
pub const KEEP_MARKER_FILE_NAME: &str = ".pkgkeep";

/// Content cache namespace for registry HTTP responses
pub const HTTP_CACHE_NAMESPACE: &str = "http";

const DEFAULT_REGISTRY_URL: &str = "https://api.registry.embedpm.org";
const SETTINGS_FILE_NAME: &str = "settings.json";
const CORE_DIR_ENV: &str = "EMBEDPM_CORE_DIR";

/// Process-wide settings, constructed once and passed to the managers
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub core_dir: PathBuf,
    /// Engine version that platforms are gated against
    pub engine_version: String,
    pub registry_url: String,
    pub download: DownloadConfig,
    pub disable_progress: bool,
    /// Tool packages the CLI itself relies on; never pruned as unnecessary
    pub core_packages: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            core_dir: core_dir(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            download: DownloadConfig::default(),
            disable_progress: false,
            core_packages: Vec::new(),
        }
    }
}

/// Download-related configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadConfig {
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Upper bound on attempts for transient failures
    pub max_attempts: u32,
    /// First retry delay; doubled on every subsequent attempt
    pub backoff_base_ms: u64,
    /// Bounded worker pool size for dependency installs
    pub max_parallel: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_attempts: 3,
            backoff_base_ms: 500,
            max_parallel: 4,
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Settings {
    /// Load settings for the given core directory.
    ///
    /// Reads `<core_dir>/settings.json` when present; a missing or unreadable
    /// file falls back to defaults so that the tool keeps working.
    pub fn load(core_dir: &Path) -> Self {
        let path = core_dir.join(SETTINGS_FILE_NAME);
        let mut settings = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<Settings>(&content).unwrap_or_else(|e| {
                warn!("Ignoring malformed settings file {:?}: {}", path, e);
                Settings::default()
            }),
            Err(_) => {
                debug!("No settings file at {:?}, using defaults", path);
                Settings::default()
            }
        };
        settings.core_dir = core_dir.to_path_buf();
        settings
    }

    /// Load settings from the default core directory
    pub fn from_env() -> Self {
        Self::load(&core_dir())
    }

    pub fn platforms_dir(&self) -> PathBuf {
        self.core_dir.join("platforms")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.core_dir.join("packages")
    }

    pub fn libraries_dir(&self) -> PathBuf {
        self.core_dir.join("lib")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.core_dir.join(".cache").join("downloads")
    }

    pub fn cache_db_path(&self) -> PathBuf {
        self.core_dir.join(".cache").join("content.db")
    }

    /// Slot lock files, kept apart from the store roots
    pub fn locks_dir(&self) -> PathBuf {
        self.core_dir.join(".locks")
    }

    pub fn log_path(&self) -> PathBuf {
        self.core_dir.join("embedpm.log")
    }
}

/// Returns the core directory for embedpm.
/// Uses $EMBEDPM_CORE_DIR if set,
/// otherwise falls back to ~/.embedpm,
/// or ./.embedpm if neither is available.
pub fn core_dir() -> PathBuf {
    core_dir_with_env(std::env::var(CORE_DIR_ENV).ok(), dirs::home_dir())
}

fn core_dir_with_env(core_dir_env: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    core_dir_env
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".embedpm")))
        .unwrap_or_else(|| PathBuf::from(".embedpm"))
}
