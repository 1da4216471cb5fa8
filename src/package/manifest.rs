//! Installed package records
//!
//! Every committed package directory carries a manifest file. The store
//! rebuilds its view of installed packages solely from these files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MANIFEST_FILE_NAME;
use crate::error::StoreError;
use crate::package::semver::parse_version;
use crate::package::spec::{PackageKind, PackageSpec};

/// Persisted identity of an installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub kind: PackageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub name: String,
    pub version: String,
    /// Canonical specifier the package was installed for
    pub spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_signature: Option<String>,
    /// Download URL, repository or path the content came from
    pub source: String,
    /// Whether `source` is an external locator rather than a registry file
    #[serde(default)]
    pub external: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub installed_at: DateTime<Utc>,
    /// Directory name the manifest was committed into
    pub slot: String,
}

impl Manifest {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE_NAME)
    }

    /// Read the manifest of a package directory
    pub fn read_from(dir: &Path) -> Result<Self, StoreError> {
        let path = Self::path_in(dir);
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| StoreError::InvalidManifest {
            path,
            message: e.to_string(),
        })
    }

    /// Write the manifest into a package directory
    pub fn write_to(&self, dir: &Path) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path_in(dir), content)?;
        Ok(())
    }
}

/// An installed package as seen through the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub manifest: Manifest,
    pub path: PathBuf,
}

impl InstalledPackage {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    pub fn kind(&self) -> PackageKind {
        self.manifest.kind
    }

    pub fn checksum(&self) -> Option<&str> {
        self.manifest.checksum.as_deref()
    }

    pub fn spec_signature(&self) -> Option<&str> {
        self.manifest.spec_signature.as_deref()
    }

    pub fn is_external(&self) -> bool {
        self.manifest.external
    }

    /// The specifier this package was installed for
    pub fn spec(&self) -> Option<PackageSpec> {
        PackageSpec::parse(self.manifest.kind, &self.manifest.spec).ok()
    }

    /// Whether this package satisfies a requirement
    pub fn satisfies(&self, spec: &PackageSpec) -> bool {
        if spec.kind != self.manifest.kind {
            return false;
        }
        if let (Some(wanted), Some(owner)) = (&spec.owner, &self.manifest.owner)
            && wanted != owner
        {
            return false;
        }
        match &spec.requirement {
            external if external.is_external() => {
                self.manifest.external
                    && external.locator().as_deref() == Some(self.manifest.source.as_str())
            }
            requirement => {
                spec.name == self.manifest.name
                    && parse_version(&self.manifest.version)
                        .is_some_and(|version| requirement.matches_version(&version))
            }
        }
    }

    /// Keep-marker protects a package from cascade uninstall and pruning
    pub fn has_keep_marker(&self) -> bool {
        self.path.join(crate::config::KEEP_MARKER_FILE_NAME).is_file()
    }
}
