use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Package not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Checksum mismatch for {url}: expected {expected}, got {actual}")]
    Integrity {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Transient network failure for {url} after {attempts} attempts: {message}")]
    TransientNetwork {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("HTTP {status} while fetching {url}")]
    Http { url: String, status: u16 },

    #[error("Network error while fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Git checkout of {locator} failed: {message}")]
    Vcs { locator: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("Unsupported archive format: {0}")]
    UnsupportedArchive(PathBuf),

    #[error("Archive entry escapes destination: {0}")]
    UnsafeEntry(String),

    #[error("Destination already exists: {0}")]
    DestinationExists(PathBuf),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UnpackError {
    /// Low-level I/O failures are the ones worth a second attempt without progress reporting
    pub fn is_io(&self) -> bool {
        match self {
            UnpackError::Io(_) => true,
            UnpackError::Zip(zip::result::ZipError::Io(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid manifest at {path}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    #[error("Staging directory not found: {0}")]
    MissingStaging(PathBuf),

    #[error("Package path is not owned by this store: {0}")]
    ForeignPath(PathBuf),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("Could not find the package with '{0}' requirements")]
    UnknownPackage(String),

    #[error(
        "Platform '{name}@{version}' requires engine '{required}', but the running engine is {engine}"
    )]
    IncompatiblePlatform {
        name: String,
        version: String,
        required: String,
        engine: String,
    },

    #[error("Invalid package specifier '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("Unknown board ID '{0}'")]
    UnknownBoard(String),

    #[error("Invalid platform descriptor at {path}: {message}")]
    InvalidDescriptor { path: PathBuf, message: String },

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Unpack(#[from] UnpackError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PackageResult<T> = Result<T, PackageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(UnpackError::Io(std::io::Error::other("short read")), true)]
    #[case(UnpackError::Zip(zip::result::ZipError::Io(std::io::Error::other("short read"))), true)]
    #[case(UnpackError::Zip(zip::result::ZipError::FileNotFound), false)]
    #[case(UnpackError::UnsupportedArchive(PathBuf::from("gcc.rar")), false)]
    #[case(UnpackError::UnsafeEntry("../etc/passwd".to_string()), false)]
    #[case(UnpackError::DestinationExists(PathBuf::from("packages/gcc")), false)]
    fn is_io_only_for_low_level_failures(#[case] error: UnpackError, #[case] expected: bool) {
        assert_eq!(error.is_io(), expected);
    }
}
