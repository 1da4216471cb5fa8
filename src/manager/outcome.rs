use std::fmt;

use crate::package::manifest::InstalledPackage;
use crate::package::spec::PackageSpec;

/// Result of an install that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The spec was already satisfied; nothing was fetched
    AlreadyInstalled(InstalledPackage),
    Installed(InstalledPackage),
}

impl InstallOutcome {
    pub fn package(&self) -> &InstalledPackage {
        match self {
            InstallOutcome::AlreadyInstalled(pkg) | InstallOutcome::Installed(pkg) => pkg,
        }
    }

    pub fn into_package(self) -> InstalledPackage {
        match self {
            InstallOutcome::AlreadyInstalled(pkg) | InstallOutcome::Installed(pkg) => pkg,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, InstallOutcome::Installed(_))
    }
}

/// Result of an update that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate(InstalledPackage),
    Updated {
        from: InstalledPackage,
        to: InstalledPackage,
    },
}

impl UpdateOutcome {
    /// The package installed after the update
    pub fn package(&self) -> &InstalledPackage {
        match self {
            UpdateOutcome::UpToDate(pkg) => pkg,
            UpdateOutcome::Updated { to, .. } => to,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyStatus {
    Installed(InstalledPackage),
    AlreadyInstalled(InstalledPackage),
    /// Optional dependencies are not installed by the cascade
    SkippedOptional,
    Failed(String),
}

/// Per-dependency result of a platform install cascade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyReport {
    pub name: String,
    pub spec: Option<PackageSpec>,
    pub status: DependencyStatus,
}

impl DependencyReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, DependencyStatus::Failed(_))
    }
}

/// Platform install result with its cascade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInstall {
    pub outcome: InstallOutcome,
    pub dependencies: Vec<DependencyReport>,
}

impl PlatformInstall {
    pub fn failed_dependencies(&self) -> impl Iterator<Item = &DependencyReport> {
        self.dependencies.iter().filter(|d| d.is_failure())
    }
}

/// Platform update result with the dependencies it filled in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformUpdate {
    pub outcome: UpdateOutcome,
    pub dependencies: Vec<DependencyReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetainReason {
    /// Still declared by another installed platform
    RequiredBy(String),
    KeepMarker,
}

impl fmt::Display for RetainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetainReason::RequiredBy(platform) => write!(f, "required by {}", platform),
            RetainReason::KeepMarker => f.write_str("protected by keep-marker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedPackage {
    pub package: InstalledPackage,
    pub reason: RetainReason,
}

/// Platform uninstall result with its cascade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformUninstall {
    pub package: InstalledPackage,
    pub removed: Vec<InstalledPackage>,
    pub retained: Vec<RetainedPackage>,
}

/// Result of uninstalling a single dependency package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyUninstall {
    Removed(InstalledPackage),
    Retained(RetainedPackage),
}
