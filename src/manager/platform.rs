//! Platform orchestration on top of the generic package managers
//!
//! Adds the engine compatibility gate, the dependency cascade, retention
//! rules on uninstall and board queries.

use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use semver::Version;
use tracing::{debug, info, warn};

use crate::cache::Memoized;
use crate::config::{MEMO_TTL, REGISTERED_BOARDS_TTL, Settings};
use crate::download::Downloader;
use crate::error::{PackageError, PackageResult, RegistryError};
use crate::manager::core::{PackageManager, Prepared, StagedPackage, UpdateTarget};
use crate::manager::outcome::{
    DependencyReport, DependencyStatus, DependencyUninstall, InstallOutcome, PlatformInstall,
    PlatformUninstall, PlatformUpdate, RetainReason, RetainedPackage, UpdateOutcome,
};
use crate::package::manifest::InstalledPackage;
use crate::package::resolver::Resolver;
use crate::package::semver::parse_version;
use crate::package::spec::{PackageKind, PackageSpec};
use crate::platform::{BoardConfig, DeclaredDependency, Platform, PlatformFactory};
use crate::registry::{RegistryClient, current_system};
use crate::store::LocalPackageStore;

const BOARDS_PATH: &str = "/v2/boards";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    pub skip_dependencies: bool,
    pub force: bool,
}

pub struct PlatformManager {
    platforms: PackageManager,
    tools: PackageManager,
    libraries: PackageManager,
    factory: Arc<dyn PlatformFactory>,
    registry: Arc<dyn RegistryClient>,
    engine_version: Version,
    max_parallel: usize,
    core_packages: Vec<String>,
    installed_boards: Memoized<(), Vec<BoardConfig>>,
}

impl PlatformManager {
    pub fn new(
        settings: &Settings,
        registry: Arc<dyn RegistryClient>,
        downloader: Arc<Downloader>,
        factory: Arc<dyn PlatformFactory>,
    ) -> PackageResult<Self> {
        let engine_version =
            parse_version(&settings.engine_version).ok_or_else(|| PackageError::InvalidSpec {
                spec: settings.engine_version.clone(),
                reason: "invalid engine version".to_string(),
            })?;
        let resolver = Arc::new(Resolver::new(registry.clone(), current_system()));
        let with_progress = !settings.disable_progress;
        let manager = |kind: PackageKind, root: PathBuf| {
            PackageManager::new(
                LocalPackageStore::new(kind, root, settings.locks_dir().join(kind.to_string())),
                resolver.clone(),
                downloader.clone(),
                with_progress,
            )
        };

        Ok(Self {
            platforms: manager(PackageKind::Platform, settings.platforms_dir()),
            tools: manager(PackageKind::Tool, settings.packages_dir()),
            libraries: manager(PackageKind::Library, settings.libraries_dir()),
            factory,
            registry,
            engine_version,
            max_parallel: settings.download.max_parallel.max(1),
            core_packages: settings.core_packages.clone(),
            installed_boards: Memoized::new(MEMO_TTL),
        })
    }

    pub fn platforms(&self) -> &PackageManager {
        &self.platforms
    }

    pub fn tools(&self) -> &PackageManager {
        &self.tools
    }

    pub fn libraries(&self) -> &PackageManager {
        &self.libraries
    }

    pub fn manager_for(&self, kind: PackageKind) -> &PackageManager {
        match kind {
            PackageKind::Platform => &self.platforms,
            PackageKind::Tool => &self.tools,
            PackageKind::Library => &self.libraries,
        }
    }

    pub fn engine_version(&self) -> &Version {
        &self.engine_version
    }

    /// Install a platform and, unless skipped, the packages it declares.
    ///
    /// Dependency failures are reported per dependency and never roll back
    /// the committed platform; re-running install fills in what is missing.
    pub async fn install(
        &self,
        spec: &PackageSpec,
        options: InstallOptions,
    ) -> PackageResult<PlatformInstall> {
        let (outcome, platform) = match self.platforms.prepare(spec, options.force).await? {
            Prepared::AlreadyInstalled(pkg) => {
                let platform = self.factory.construct(&pkg)?;
                (InstallOutcome::AlreadyInstalled(pkg), platform)
            }
            Prepared::Staged(staged) => {
                let first_install = staged.replaces().is_none();
                let (pkg, platform) = self.commit_platform(staged)?;
                if first_install && let Err(e) = platform.on_installed() {
                    warn!("Post-install hook of {} failed: {}", pkg.name(), e);
                }
                (InstallOutcome::Installed(pkg), platform)
            }
        };
        self.installed_boards.clear();

        let dependencies = if options.skip_dependencies {
            Vec::new()
        } else {
            self.install_dependencies(platform.declared_dependencies())
                .await
        };
        Ok(PlatformInstall {
            outcome,
            dependencies,
        })
    }

    /// Uninstall a platform, then the dependencies nothing else needs.
    ///
    /// Dependencies are handled before the platform itself is removed, so an
    /// interrupted uninstall never leaves a platform whose packages are gone.
    pub async fn uninstall(
        &self,
        spec: &PackageSpec,
        skip_dependencies: bool,
    ) -> PackageResult<PlatformUninstall> {
        let pkg = self
            .platforms
            .find(spec)?
            .ok_or_else(|| PackageError::UnknownPackage(spec.to_string()))?;
        let platform = match self.factory.construct(&pkg) {
            Ok(platform) => Some(platform),
            Err(e) => {
                warn!("Cannot load platform {}, keeping its dependencies: {}", pkg.name(), e);
                None
            }
        };

        let mut removed = Vec::new();
        let mut retained = Vec::new();
        if !skip_dependencies && let Some(platform) = &platform {
            let declared_elsewhere = self.declared_by_platforms(Some(&pkg))?;
            for dep in platform.declared_dependencies() {
                let Ok(dep_spec) = dep.spec() else {
                    continue;
                };
                let manager = self.manager_for(dep_spec.kind);
                let Some(dep_pkg) = manager.find(&dep_spec)? else {
                    continue;
                };

                let reason = if dep_pkg.has_keep_marker() {
                    Some(RetainReason::KeepMarker)
                } else {
                    required_by(&declared_elsewhere, &dep_pkg).map(RetainReason::RequiredBy)
                };
                match reason {
                    Some(reason) => {
                        info!("Keeping {} {}: {}", dep_pkg.name(), dep_pkg.version(), reason);
                        retained.push(RetainedPackage {
                            package: dep_pkg,
                            reason,
                        });
                    }
                    None => {
                        manager.remove_package(&dep_pkg).await?;
                        removed.push(dep_pkg);
                    }
                }
            }
        }

        self.platforms.remove_package(&pkg).await?;
        if let Some(platform) = platform
            && let Err(e) = platform.on_uninstalled()
        {
            warn!("Post-uninstall hook of {} failed: {}", pkg.name(), e);
        }
        self.installed_boards.clear();

        Ok(PlatformUninstall {
            package: pkg,
            removed,
            retained,
        })
    }

    /// Uninstall a tool or library unless an installed platform still declares it
    pub async fn uninstall_dependency(
        &self,
        spec: &PackageSpec,
    ) -> PackageResult<DependencyUninstall> {
        if spec.kind == PackageKind::Platform {
            return Err(PackageError::InvalidSpec {
                spec: spec.to_string(),
                reason: "platforms are uninstalled with their dependencies".to_string(),
            });
        }
        let manager = self.manager_for(spec.kind);
        let pkg = manager
            .find(spec)?
            .ok_or_else(|| PackageError::UnknownPackage(spec.to_string()))?;

        let declared = self.declared_by_platforms(None)?;
        if let Some(platform) = required_by(&declared, &pkg) {
            info!("Keeping {} {}: required by {}", pkg.name(), pkg.version(), platform);
            return Ok(DependencyUninstall::Retained(RetainedPackage {
                package: pkg,
                reason: RetainReason::RequiredBy(platform),
            }));
        }

        manager.remove_package(&pkg).await?;
        Ok(DependencyUninstall::Removed(pkg))
    }

    /// Update a platform with install-then-prune semantics
    pub async fn update(
        &self,
        from: &PackageSpec,
        to: Option<&PackageSpec>,
        skip_dependencies: bool,
    ) -> PackageResult<PlatformUpdate> {
        let outcome = match self.platforms.update_target(from, to).await? {
            UpdateTarget::UpToDate(pkg) => UpdateOutcome::UpToDate(pkg),
            UpdateTarget::Replace { current, target } => {
                let installed = match self.platforms.prepare(&target, true).await? {
                    Prepared::AlreadyInstalled(pkg) => pkg,
                    Prepared::Staged(staged) => self.commit_platform(staged)?.0,
                };
                self.platforms.prune_replaced(&current, &installed).await?;
                UpdateOutcome::Updated {
                    from: current,
                    to: installed,
                }
            }
        };
        self.installed_boards.clear();

        let dependencies = if skip_dependencies {
            Vec::new()
        } else {
            let platform = self.factory.construct(outcome.package())?;
            self.install_dependencies(platform.declared_dependencies())
                .await
        };
        Ok(PlatformUpdate {
            outcome,
            dependencies,
        })
    }

    /// Gate a staged platform on engine compatibility, then commit it.
    /// An incompatible platform is discarded, leaving the store unchanged.
    fn commit_platform(
        &self,
        staged: StagedPackage,
    ) -> PackageResult<(InstalledPackage, Box<dyn Platform>)> {
        let view = staged.view();
        let checked = self
            .factory
            .construct(&view)
            .and_then(|platform| self.check_compatibility(&view, platform.as_ref()));
        if let Err(e) = checked {
            self.platforms.discard(staged)?;
            return Err(e);
        }

        let pkg = self.platforms.commit(staged)?;
        let platform = self.factory.construct(&pkg)?;
        Ok((pkg, platform))
    }

    fn check_compatibility(
        &self,
        pkg: &InstalledPackage,
        platform: &dyn Platform,
    ) -> PackageResult<()> {
        match platform.compatible_engine_range() {
            Some(range) if !range.matches(&self.engine_version) => {
                Err(PackageError::IncompatiblePlatform {
                    name: pkg.name().to_string(),
                    version: pkg.version().to_string(),
                    required: range.to_string(),
                    engine: self.engine_version.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn install_dependencies(&self, declared: Vec<DeclaredDependency>) -> Vec<DependencyReport> {
        let mut reports: Vec<DependencyReport> = stream::iter(declared)
            .map(|dep| self.install_dependency(dep))
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    async fn install_dependency(&self, dep: DeclaredDependency) -> DependencyReport {
        let spec = match dep.spec() {
            Ok(spec) => spec,
            Err(e) => {
                return DependencyReport {
                    name: dep.name,
                    spec: None,
                    status: DependencyStatus::Failed(e.to_string()),
                };
            }
        };
        if dep.optional {
            debug!("Skipping optional dependency {}", spec);
            return DependencyReport {
                name: dep.name,
                spec: Some(spec),
                status: DependencyStatus::SkippedOptional,
            };
        }

        let status = match self.manager_for(spec.kind).install(&spec, false).await {
            Ok(InstallOutcome::Installed(pkg)) => DependencyStatus::Installed(pkg),
            Ok(InstallOutcome::AlreadyInstalled(pkg)) => DependencyStatus::AlreadyInstalled(pkg),
            Err(e) => {
                warn!("Failed to install dependency {}: {}", spec, e);
                DependencyStatus::Failed(e.to_string())
            }
        };
        DependencyReport {
            name: dep.name,
            spec: Some(spec),
            status,
        }
    }

    /// Specs declared by installed platforms, paired with the declaring platform
    fn declared_by_platforms(
        &self,
        excluding: Option<&InstalledPackage>,
    ) -> PackageResult<Vec<(String, PackageSpec)>> {
        let mut declared = Vec::new();
        for pkg in self.platforms.list()? {
            if excluding.is_some_and(|ex| ex.manifest.slot == pkg.manifest.slot) {
                continue;
            }
            let platform = match self.factory.construct(&pkg) {
                Ok(platform) => platform,
                Err(e) => {
                    warn!("Skipping unreadable platform {}: {}", pkg.name(), e);
                    continue;
                }
            };
            declared.extend(
                platform
                    .declared_dependencies()
                    .iter()
                    .filter_map(|dep| dep.spec().ok())
                    .map(|spec| (pkg.name().to_string(), spec)),
            );
        }
        Ok(declared)
    }

    /// Boards shipped by installed platforms, sorted by name
    pub fn installed_boards(&self) -> PackageResult<Vec<BoardConfig>> {
        self.installed_boards
            .get_or_compute(&(), || -> PackageResult<Vec<BoardConfig>> {
                let mut boards = Vec::new();
                for pkg in self.platforms.list()? {
                    match self.factory.construct(&pkg).and_then(|p| p.boards()) {
                        Ok(platform_boards) => boards.extend(platform_boards),
                        Err(e) => warn!("Skipping boards of {}: {}", pkg.name(), e),
                    }
                }
                boards.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(boards)
            })
    }

    /// Boards known to the registry
    pub async fn registered_boards(&self) -> PackageResult<Vec<BoardConfig>> {
        let value = self
            .registry
            .fetch_json_data("GET", BOARDS_PATH, Some(REGISTERED_BOARDS_TTL))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| RegistryError::InvalidResponse(e.to_string()).into())
    }

    /// Installed boards plus registered ones not installed, sorted by name.
    /// Works offline with installed boards only.
    pub async fn all_boards(&self) -> PackageResult<Vec<BoardConfig>> {
        let mut boards = self.installed_boards()?;
        match self.registered_boards().await {
            Ok(registered) => {
                let missing: Vec<BoardConfig> = registered
                    .into_iter()
                    .filter(|board| {
                        !boards
                            .iter()
                            .any(|b| b.id == board.id && b.platform == board.platform)
                    })
                    .collect();
                boards.extend(missing);
            }
            Err(e) => warn!("Registered boards unavailable: {}", e),
        }
        boards.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(boards)
    }

    /// Board configuration by id, installed platforms first
    pub async fn board_config(
        &self,
        id: &str,
        platform: Option<&str>,
    ) -> PackageResult<BoardConfig> {
        let wanted = |board: &BoardConfig| {
            board.id == id && platform.is_none_or(|p| board.platform.as_deref() == Some(p))
        };

        if let Some(board) = self.installed_boards()?.into_iter().find(|b| wanted(b)) {
            return Ok(board);
        }
        match self.registered_boards().await {
            Ok(boards) => {
                if let Some(board) = boards.into_iter().find(|b| wanted(b)) {
                    return Ok(board);
                }
            }
            Err(e) => warn!("Registered boards unavailable: {}", e),
        }
        Err(PackageError::UnknownBoard(id.to_string()))
    }

    /// Tool packages no installed platform declares, excluding externally
    /// sourced, keep-marked and core ones. Removes them unless `dry_run`.
    pub async fn remove_unnecessary_packages(
        &self,
        dry_run: bool,
    ) -> PackageResult<Vec<InstalledPackage>> {
        let declared = self.declared_by_platforms(None)?;
        let unnecessary: Vec<InstalledPackage> = self
            .tools
            .list()?
            .into_iter()
            .filter(|pkg| !pkg.is_external() && !pkg.has_keep_marker())
            .filter(|pkg| !self.core_packages.iter().any(|name| name == pkg.name()))
            .filter(|pkg| required_by(&declared, pkg).is_none())
            .collect();

        if !dry_run {
            for pkg in &unnecessary {
                self.tools.remove_package(pkg).await?;
            }
        }
        Ok(unnecessary)
    }

    /// Clean abandoned staging areas and corrupt entries in every store
    pub fn prune_orphans(&self) -> PackageResult<Vec<PathBuf>> {
        let mut removed = self.platforms.prune_orphans()?;
        removed.extend(self.tools.prune_orphans()?);
        removed.extend(self.libraries.prune_orphans()?);
        Ok(removed)
    }
}

/// Name of a platform whose declared spec the package satisfies
fn required_by(declared: &[(String, PackageSpec)], pkg: &InstalledPackage) -> Option<String> {
    declared
        .iter()
        .find(|(_, spec)| pkg.satisfies(spec))
        .map(|(platform, _)| platform.clone())
}
