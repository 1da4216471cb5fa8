//! Registry client seam and the metadata it returns

mod http;

use std::time::Duration;

use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

use crate::config::PACKAGE_METADATA_TTL;
use crate::error::RegistryError;
use crate::package::spec::PackageKind;

pub use http::HttpRegistryClient;

/// Opaque, cacheable JSON access to the package registry
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    /// Perform `method` on `path`, serving from the content cache when
    /// `cache_ttl` is given and a fresh entry exists
    async fn fetch_json_data(
        &self,
        method: &str,
        path: &str,
        cache_ttl: Option<Duration>,
    ) -> Result<serde_json::Value, RegistryError>;
}

/// Published package metadata
#[derive(Debug, Clone, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    #[serde(default)]
    pub versions: Vec<VersionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    #[serde(default)]
    pub files: Vec<FileInfo>,
}

impl VersionInfo {
    /// File installable on the given system, if any
    pub fn file_for(&self, system: &str) -> Option<&FileInfo> {
        self.files.iter().find(|file| file.system.supports(system))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileInfo {
    pub download_url: String,
    #[serde(default)]
    pub checksum: Checksum,
    #[serde(default)]
    pub system: SystemFilter,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Checksum {
    pub sha256: Option<String>,
}

/// Systems a file can be installed on: `"*"` or a list of system ids
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SystemFilter {
    Any(String),
    List(Vec<String>),
}

impl Default for SystemFilter {
    fn default() -> Self {
        SystemFilter::Any("*".to_string())
    }
}

impl SystemFilter {
    pub fn supports(&self, system: &str) -> bool {
        match self {
            SystemFilter::Any(value) => value == "*" || value == system,
            SystemFilter::List(systems) => systems.iter().any(|s| s == "*" || s == system),
        }
    }
}

/// Registry path of a package's metadata
pub fn package_path(kind: PackageKind, owner: Option<&str>, name: &str) -> String {
    match owner {
        Some(owner) => format!("/v3/packages/{}/{}/{}", owner, kind, name),
        None => format!("/v3/packages/{}/{}", kind, name),
    }
}

/// Fetch and decode a package's published metadata
pub async fn fetch_package_info(
    client: &dyn RegistryClient,
    kind: PackageKind,
    owner: Option<&str>,
    name: &str,
) -> Result<PackageInfo, RegistryError> {
    let path = package_path(kind, owner, name);
    let value = client
        .fetch_json_data("GET", &path, Some(PACKAGE_METADATA_TTL))
        .await?;
    serde_json::from_value(value).map_err(|e| RegistryError::InvalidResponse(e.to_string()))
}

/// System id of the running host, as used by registry file filters
pub fn current_system() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match (os, std::env::consts::ARCH) {
        ("windows", "x86_64") => "amd64",
        ("windows", "x86") => "x86",
        ("darwin", "aarch64") => "arm64",
        (_, "arm") => "armv7l",
        (_, other) => other,
    };
    format!("{}_{}", os, arch)
}
