//! Resolves package specs against the local store and the registry

use std::sync::Arc;

use tracing::debug;

use crate::error::{PackageError, PackageResult, RegistryError};
use crate::package::manifest::InstalledPackage;
use crate::package::semver::highest_matching;
use crate::package::spec::PackageSpec;
use crate::registry::{RegistryClient, fetch_package_info};
use crate::store::LocalPackageStore;

/// A published file selected for installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub name: String,
    pub owner: Option<String>,
    pub version: String,
    pub download_url: String,
    pub checksum: Option<String>,
}

/// What a spec resolved to
#[derive(Debug, Clone)]
pub enum Resolution {
    /// An installed package already satisfies the spec
    Installed(InstalledPackage),
    /// Highest matching registry version
    Remote(RemoteArtifact),
    /// External source, fetched by its locator
    External,
}

pub struct Resolver {
    registry: Arc<dyn RegistryClient>,
    system: String,
}

impl Resolver {
    pub fn new(registry: Arc<dyn RegistryClient>, system: impl Into<String>) -> Self {
        Self {
            registry,
            system: system.into(),
        }
    }

    /// Installed packages first, then the registry
    pub async fn resolve(
        &self,
        store: &LocalPackageStore,
        spec: &PackageSpec,
    ) -> PackageResult<Resolution> {
        if let Some(pkg) = store.find(spec)? {
            debug!("{} satisfied by installed {} {}", spec, pkg.name(), pkg.version());
            return Ok(Resolution::Installed(pkg));
        }
        self.resolve_uninstalled(spec).await
    }

    /// Resolve ignoring what is installed
    pub async fn resolve_uninstalled(&self, spec: &PackageSpec) -> PackageResult<Resolution> {
        if spec.is_external() {
            return Ok(Resolution::External);
        }
        self.resolve_remote(spec).await.map(Resolution::Remote)
    }

    /// Highest registry version satisfying the spec with a file for this system
    pub async fn resolve_remote(&self, spec: &PackageSpec) -> PackageResult<RemoteArtifact> {
        let unknown = || PackageError::UnknownPackage(spec.to_string());
        if spec.is_external() {
            return Err(unknown());
        }

        let info = match fetch_package_info(
            self.registry.as_ref(),
            spec.kind,
            spec.owner.as_deref(),
            &spec.name,
        )
        .await
        {
            Ok(info) => info,
            Err(RegistryError::NotFound(_)) => return Err(unknown()),
            Err(e) => return Err(e.into()),
        };

        let installable = info
            .versions
            .iter()
            .filter(|version| version.file_for(&self.system).is_some());
        let best = highest_matching(installable, |v| v.name.as_str(), |version| {
            spec.requirement.matches_version(version)
        })
        .ok_or_else(unknown)?;
        let file = best.file_for(&self.system).ok_or_else(unknown)?;

        debug!("{} resolved to {} {}", spec, spec.name, best.name);
        Ok(RemoteArtifact {
            name: spec.name.clone(),
            owner: spec.owner.clone(),
            version: best.name.clone(),
            download_url: file.download_url.clone(),
            checksum: file.checksum.sha256.clone(),
        })
    }
}
