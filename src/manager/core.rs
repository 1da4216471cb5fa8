//! Kind-agnostic install, uninstall and update against one store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::download::{Downloader, copy_dir, sha256_file};
use crate::error::{PackageError, PackageResult, UnpackError};
use crate::manager::outcome::{InstallOutcome, UpdateOutcome};
use crate::package::descriptor::PackageDescriptor;
use crate::package::manifest::{InstalledPackage, Manifest};
use crate::package::resolver::{RemoteArtifact, Resolution, Resolver};
use crate::package::semver::parse_version;
use crate::package::spec::{PackageKind, PackageSpec, Requirement, short_digest};
use crate::store::{LocalPackageStore, SlotLock, Staging};

/// A package materialized in a staging area, holding its slot lock until it
/// is committed or discarded
#[derive(Debug)]
pub struct StagedPackage {
    lock: SlotLock,
    staging: Staging,
    manifest: Manifest,
    /// Package occupying the slot before this install
    previous: Option<InstalledPackage>,
}

impl StagedPackage {
    /// The staged package as the store would list it once committed
    pub fn view(&self) -> InstalledPackage {
        InstalledPackage {
            manifest: self.manifest.clone(),
            path: self.staging.content_dir().to_path_buf(),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn replaces(&self) -> Option<&InstalledPackage> {
        self.previous.as_ref()
    }
}

/// Either an existing package or one ready to commit
#[derive(Debug)]
pub enum Prepared {
    AlreadyInstalled(InstalledPackage),
    Staged(StagedPackage),
}

/// Generic package manager: resolver, downloader and unpacker driven
/// against a single store
pub struct PackageManager {
    store: LocalPackageStore,
    resolver: Arc<Resolver>,
    downloader: Arc<Downloader>,
    with_progress: bool,
}

impl PackageManager {
    pub fn new(
        store: LocalPackageStore,
        resolver: Arc<Resolver>,
        downloader: Arc<Downloader>,
        with_progress: bool,
    ) -> Self {
        Self {
            store,
            resolver,
            downloader,
            with_progress,
        }
    }

    pub fn kind(&self) -> PackageKind {
        self.store.kind()
    }

    /// Read-only store access for collaborators
    pub fn store(&self) -> &LocalPackageStore {
        &self.store
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn list(&self) -> PackageResult<Vec<InstalledPackage>> {
        Ok(self.store.list()?)
    }

    pub fn find(&self, spec: &PackageSpec) -> PackageResult<Option<InstalledPackage>> {
        Ok(self.store.find(spec)?)
    }

    /// Path of the best installed package satisfying the spec
    pub fn package_dir(&self, spec: &PackageSpec) -> PackageResult<Option<PathBuf>> {
        Ok(self.find(spec)?.map(|pkg| pkg.path))
    }

    /// Install a package, returning the existing one when already satisfied
    pub async fn install(&self, spec: &PackageSpec, force: bool) -> PackageResult<InstallOutcome> {
        match self.prepare(spec, force).await? {
            Prepared::AlreadyInstalled(pkg) => Ok(InstallOutcome::AlreadyInstalled(pkg)),
            Prepared::Staged(staged) => self.commit(staged).map(InstallOutcome::Installed),
        }
    }

    /// Resolve and materialize a spec into a staging area without committing.
    ///
    /// Holds the slot lock from before the fetch until commit or discard. A
    /// caller that had to wait for the lock re-checks the store first, so
    /// concurrent installs of the same spec fetch only once.
    pub async fn prepare(&self, spec: &PackageSpec, force: bool) -> PackageResult<Prepared> {
        self.check_spec(spec)?;
        let resolution = if force {
            self.resolver.resolve_uninstalled(spec).await?
        } else {
            self.resolver.resolve(&self.store, spec).await?
        };
        if let Resolution::Installed(pkg) = resolution {
            return Ok(Prepared::AlreadyInstalled(pkg));
        }

        let slot = LocalPackageStore::slot_for(spec);
        let lock = self.lock_slot(&slot).await?;
        if !force && let Some(pkg) = self.store.find(spec)? {
            debug!("{} was installed while waiting for the slot lock", spec);
            return Ok(Prepared::AlreadyInstalled(pkg));
        }

        let previous = self.store.get(&slot);
        let staging = self.store.begin_install(spec)?;
        match self.materialize(spec, &resolution, &staging, &slot, force).await {
            Ok(manifest) => Ok(Prepared::Staged(StagedPackage {
                lock,
                staging,
                manifest,
                previous,
            })),
            Err(e) => {
                if let Err(discard_err) = self.store.discard(staging) {
                    warn!("Failed to discard staging area: {}", discard_err);
                }
                Err(e)
            }
        }
    }

    /// Commit a staged package into its slot, replacing any previous occupant
    pub fn commit(&self, staged: StagedPackage) -> PackageResult<InstalledPackage> {
        let StagedPackage {
            lock,
            staging,
            manifest,
            ..
        } = staged;
        Ok(self.store.commit(&lock, staging, manifest)?)
    }

    /// Drop a staged package, leaving the store exactly as it was
    pub fn discard(&self, staged: StagedPackage) -> PackageResult<()> {
        info!(
            "Discarding staged {} {}",
            staged.manifest.name, staged.manifest.version
        );
        Ok(self.store.discard(staged.staging)?)
    }

    /// Uninstall the best installed package satisfying the spec
    pub async fn uninstall(&self, spec: &PackageSpec) -> PackageResult<InstalledPackage> {
        let pkg = self
            .find(spec)?
            .ok_or_else(|| PackageError::UnknownPackage(spec.to_string()))?;
        self.remove_package(&pkg).await?;
        Ok(pkg)
    }

    /// Remove a specific installed package under its slot lock
    pub async fn remove_package(&self, pkg: &InstalledPackage) -> PackageResult<()> {
        let lock = self.lock_slot(&pkg.manifest.slot).await?;
        let path = match pkg.path.parent() {
            // staged views live outside the store root; remove through the slot
            Some(parent) if parent == self.store.root() => pkg.path.clone(),
            _ => self.store.root().join(&pkg.manifest.slot),
        };
        let target = InstalledPackage {
            manifest: pkg.manifest.clone(),
            path,
        };
        self.store.remove(&lock, &target)?;
        Ok(())
    }

    /// Newer registry version satisfying the spec the package was installed for
    pub async fn outdated(&self, pkg: &InstalledPackage) -> PackageResult<Option<RemoteArtifact>> {
        if pkg.is_external() {
            return Ok(None);
        }
        let spec = pkg
            .spec()
            .unwrap_or_else(|| PackageSpec {
                kind: pkg.kind(),
                owner: pkg.manifest.owner.clone(),
                name: pkg.name().to_string(),
                requirement: Requirement::Wildcard,
            });
        let latest = self.resolver.resolve_remote(&spec).await?;
        let newer = match (parse_version(&latest.version), parse_version(pkg.version())) {
            (Some(latest), Some(current)) => latest > current,
            _ => false,
        };
        Ok(newer.then_some(latest))
    }

    /// Replace an installed package with a newer one.
    ///
    /// The new package is committed before the old one is pruned, so one of
    /// them is installed at every point in time.
    pub async fn update(
        &self,
        from: &PackageSpec,
        to: Option<&PackageSpec>,
    ) -> PackageResult<UpdateOutcome> {
        let (current, target) = match self.update_target(from, to).await? {
            UpdateTarget::UpToDate(current) => return Ok(UpdateOutcome::UpToDate(current)),
            UpdateTarget::Replace { current, target } => (current, target),
        };

        let installed = match self.prepare(&target, true).await? {
            Prepared::AlreadyInstalled(pkg) => pkg,
            Prepared::Staged(staged) => self.commit(staged)?,
        };
        self.prune_replaced(&current, &installed).await?;
        Ok(UpdateOutcome::Updated {
            from: current,
            to: installed,
        })
    }

    /// Decide what an update of `from` should install
    pub(crate) async fn update_target(
        &self,
        from: &PackageSpec,
        to: Option<&PackageSpec>,
    ) -> PackageResult<UpdateTarget> {
        let current = self
            .find(from)?
            .ok_or_else(|| PackageError::UnknownPackage(from.to_string()))?;

        if let Some(to) = to {
            return Ok(UpdateTarget::Replace {
                current,
                target: to.clone(),
            });
        }

        let target = current.spec().unwrap_or_else(|| from.clone());
        if target.is_external() {
            // external sources are refetched from their locator
            return Ok(UpdateTarget::Replace { current, target });
        }
        if self.outdated(&current).await?.is_none() {
            info!("{} {} is up to date", current.name(), current.version());
            return Ok(UpdateTarget::UpToDate(current));
        }
        Ok(UpdateTarget::Replace { current, target })
    }

    /// Remove the package an update replaced, unless the update reused its slot
    pub(crate) async fn prune_replaced(
        &self,
        old: &InstalledPackage,
        new: &InstalledPackage,
    ) -> PackageResult<()> {
        if old.manifest.slot == new.manifest.slot {
            return Ok(());
        }
        info!(
            "Pruning {} {} replaced by {}",
            old.name(),
            old.version(),
            new.version()
        );
        self.remove_package(old).await
    }

    /// Delete abandoned staging areas and corrupt entries
    pub fn prune_orphans(&self) -> PackageResult<Vec<PathBuf>> {
        Ok(self.store.prune_orphans()?)
    }

    fn check_spec(&self, spec: &PackageSpec) -> PackageResult<()> {
        if spec.kind != self.kind() {
            return Err(PackageError::InvalidSpec {
                spec: spec.to_string(),
                reason: format!("expected a {} package", self.kind()),
            });
        }
        if spec.name.is_empty() {
            return Err(PackageError::InvalidSpec {
                spec: spec.to_string(),
                reason: "cannot derive a package name; use name=<source>".to_string(),
            });
        }
        Ok(())
    }

    async fn lock_slot(&self, slot: &str) -> PackageResult<SlotLock> {
        let store = self.store.clone();
        let slot = slot.to_string();
        Ok(tokio::task::spawn_blocking(move || store.lock_slot(&slot)).await??)
    }

    /// Fetch and extract the package content, returning its manifest
    async fn materialize(
        &self,
        spec: &PackageSpec,
        resolution: &Resolution,
        staging: &Staging,
        slot: &str,
        refresh: bool,
    ) -> PackageResult<Manifest> {
        let content = staging.content_dir();
        let mut manifest = Manifest {
            kind: spec.kind,
            owner: spec.owner.clone(),
            name: spec.name.clone(),
            version: String::new(),
            spec: spec.to_string(),
            spec_signature: spec.signature(),
            source: String::new(),
            external: spec.is_external(),
            checksum: None,
            installed_at: Utc::now(),
            slot: slot.to_string(),
        };

        if let Resolution::Remote(artifact) = resolution {
            let archive = self
                .downloader
                .fetch(&artifact.download_url, artifact.checksum.as_deref())
                .await?;
            self.unpack(&archive, content).await?;
            manifest.owner = artifact.owner.clone();
            manifest.name = artifact.name.clone();
            manifest.version = artifact.version.clone();
            manifest.source = artifact.download_url.clone();
            manifest.checksum = Some(sha256_file(&archive)?);
            return Ok(manifest);
        }

        manifest.source = spec.requirement.locator().unwrap_or_default();
        let fallback_version = match &spec.requirement {
            Requirement::Uri(url) => {
                // the same URL may serve new content, so forced installs refetch
                let archive = if refresh {
                    self.downloader.refetch(url, None).await?
                } else {
                    self.downloader.fetch(url, None).await?
                };
                self.unpack(&archive, content).await?;
                let checksum = sha256_file(&archive)?;
                let version = content_version(&checksum);
                manifest.checksum = Some(checksum);
                version
            }
            Requirement::Vcs { url, reference } => {
                let checkout = crate::download::checkout(url, reference.as_deref(), content).await?;
                checkout.version()
            }
            Requirement::LocalPath(path) if path.is_dir() => {
                let (src, dest) = (path.clone(), content.to_path_buf());
                let digest = tokio::task::spawn_blocking(move || copy_dir(&src, &dest)).await??;
                let version = content_version(&digest);
                manifest.checksum = Some(digest);
                version
            }
            Requirement::LocalPath(path) => {
                self.unpack(path, content).await?;
                let checksum = sha256_file(path)?;
                let version = content_version(&checksum);
                manifest.checksum = Some(checksum);
                version
            }
            registry => {
                return Err(PackageError::InvalidSpec {
                    spec: spec.to_string(),
                    reason: format!("'{}' is not an external source", registry),
                });
            }
        };

        let descriptor = PackageDescriptor::read(content, spec.kind).unwrap_or_default();
        if let Some(name) = descriptor.name.filter(|n| !n.is_empty()) {
            manifest.name = name;
        }
        manifest.version = descriptor
            .version
            .filter(|v| parse_version(v).is_some())
            .unwrap_or(fallback_version);
        Ok(manifest)
    }

    async fn unpack(&self, archive: &Path, dest: &Path) -> PackageResult<()> {
        unpack_with_fallback(archive, dest, self.with_progress, run_unpack).await
    }
}

/// What an update should do
#[derive(Debug)]
pub(crate) enum UpdateTarget {
    UpToDate(InstalledPackage),
    Replace {
        current: InstalledPackage,
        target: PackageSpec,
    },
}

/// Unpack with progress reporting, retrying once without it on I/O failure
async fn unpack_with_fallback<F, Fut>(
    archive: &Path,
    dest: &Path,
    with_progress: bool,
    run: F,
) -> PackageResult<()>
where
    F: Fn(PathBuf, PathBuf, bool) -> Fut,
    Fut: Future<Output = PackageResult<()>>,
{
    let (archive, dest) = (archive.to_path_buf(), dest.to_path_buf());
    if !with_progress {
        return run(archive, dest, false).await;
    }
    match run(archive.clone(), dest.clone(), true).await {
        Err(PackageError::Unpack(e)) if e.is_io() => {
            warn!("Unpacking {:?} failed ({}), retrying without progress", archive, e);
            if dest.exists() {
                std::fs::remove_dir_all(&dest)?;
            }
            run(archive, dest, false).await
        }
        other => other,
    }
}

async fn run_unpack(archive: PathBuf, dest: PathBuf, with_progress: bool) -> PackageResult<()> {
    tokio::task::spawn_blocking(move || crate::unpack::unpack(&archive, &dest, with_progress))
        .await?
        .map(|_| ())
        .map_err(|e: UnpackError| e.into())
}

/// Version for external content without a declared one
fn content_version(identity: &str) -> String {
    format!("0.0.0+sha256.{}", short_digest(identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;
    use crate::registry::MockRegistryClient;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use mockito::Server;
    use serde_json::json;
    use tempfile::TempDir;

    fn tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn manager(
        temp_dir: &TempDir,
        registry: MockRegistryClient,
        with_progress: bool,
    ) -> PackageManager {
        let resolver = Arc::new(Resolver::new(Arc::new(registry), "linux_x86_64"));
        let config = DownloadConfig {
            backoff_base_ms: 1,
            ..DownloadConfig::default()
        };
        let downloader = Arc::new(Downloader::new(
            reqwest::Client::new(),
            temp_dir.path().join("downloads"),
            config,
        ));
        let store = LocalPackageStore::new(
            PackageKind::Tool,
            temp_dir.path().join("packages"),
            temp_dir.path().join("locks"),
        );
        PackageManager::new(store, resolver, downloader, with_progress)
    }

    fn registry_for(url: String, versions: &[&str]) -> MockRegistryClient {
        let versions: Vec<serde_json::Value> = versions
            .iter()
            .map(|v| {
                json!({
                    "name": v,
                    "files": [{"download_url": format!("{}/gcc-{}.tar.gz", url, v), "system": "*"}]
                })
            })
            .collect();
        let mut client = MockRegistryClient::new();
        client
            .expect_fetch_json_data()
            .returning(move |_, _, _| Ok(json!({"name": "toolchain-gcc", "versions": versions})));
        client
    }

    #[tokio::test]
    async fn install_twice_fetches_once() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/gcc-1.2.3.tar.gz")
            .with_body(tar_gz(&[("gcc/bin/gcc", "v1")]))
            .expect(1)
            .create_async()
            .await;
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, registry_for(server.url(), &["1.2.3"]), true);
        let spec = PackageSpec::parse(PackageKind::Tool, "toolchain-gcc").unwrap();

        let first = manager.install(&spec, false).await.unwrap();
        let second = manager.install(&spec, false).await.unwrap();

        mock.assert_async().await;
        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.package(), second.package());
        assert_eq!(
            std::fs::read_to_string(first.package().path.join("bin/gcc")).unwrap(),
            "v1"
        );
        let found = manager.find(&spec).unwrap().unwrap();
        assert_eq!(found.checksum(), first.package().checksum());
    }

    #[tokio::test]
    async fn force_reinstall_fetches_again_into_same_slot() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/gcc-1.2.3.tar.gz")
            .with_body(tar_gz(&[("bin/gcc", "v1")]))
            .expect(1)
            .create_async()
            .await;
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, registry_for(server.url(), &["1.2.3"]), false);
        let spec = PackageSpec::parse(PackageKind::Tool, "toolchain-gcc").unwrap();

        manager.install(&spec, false).await.unwrap();
        let forced = manager.install(&spec, true).await.unwrap();

        // the archive is served from the download cache the second time
        mock.assert_async().await;
        assert!(forced.is_new());
        assert_eq!(manager.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn uninstall_removes_package_directory() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/gcc-1.2.3.tar.gz")
            .with_body(tar_gz(&[("bin/gcc", "v1")]))
            .create_async()
            .await;
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, registry_for(server.url(), &["1.2.3"]), false);
        let spec = PackageSpec::parse(PackageKind::Tool, "toolchain-gcc").unwrap();
        let installed = manager.install(&spec, false).await.unwrap().into_package();

        let removed = manager.uninstall(&spec).await.unwrap();

        assert_eq!(removed, installed);
        assert!(!installed.path.exists());
        assert!(manager.find(&spec).unwrap().is_none());
    }

    #[tokio::test]
    async fn uninstall_unknown_package_fails() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, MockRegistryClient::new(), false);
        let spec = PackageSpec::parse(PackageKind::Tool, "toolchain-gcc").unwrap();

        let result = manager.uninstall(&spec).await;

        assert!(matches!(result, Err(PackageError::UnknownPackage(_))));
    }

    #[tokio::test]
    async fn failed_download_leaves_store_empty() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/gcc-1.2.3.tar.gz")
            .with_status(404)
            .create_async()
            .await;
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, registry_for(server.url(), &["1.2.3"]), false);
        let spec = PackageSpec::parse(PackageKind::Tool, "toolchain-gcc").unwrap();

        let result = manager.install(&spec, false).await;

        assert!(matches!(result, Err(PackageError::Download(_))));
        let entries: Vec<String> = std::fs::read_dir(manager.store().root())
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(entries.is_empty(), "unexpected entries: {:?}", entries);
    }

    #[tokio::test]
    async fn update_installs_new_version_in_same_slot() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/gcc-1.2.3.tar.gz")
            .with_body(tar_gz(&[("bin/gcc", "v1")]))
            .create_async()
            .await;
        server
            .mock("GET", "/gcc-1.3.0.tar.gz")
            .with_body(tar_gz(&[("bin/gcc", "v2")]))
            .create_async()
            .await;
        let temp_dir = TempDir::new().unwrap();
        let old_manager = manager(&temp_dir, registry_for(server.url(), &["1.2.3"]), false);
        let spec = PackageSpec::parse(PackageKind::Tool, "toolchain-gcc").unwrap();
        old_manager.install(&spec, false).await.unwrap();

        let manager = manager(
            &temp_dir,
            registry_for(server.url(), &["1.2.3", "1.3.0"]),
            false,
        );
        let outcome = manager.update(&spec, None).await.unwrap();

        let UpdateOutcome::Updated { from, to } = outcome else {
            panic!("expected an update");
        };
        assert_eq!(from.version(), "1.2.3");
        assert_eq!(to.version(), "1.3.0");
        assert_eq!(manager.list().unwrap(), vec![to.clone()]);
        assert_eq!(std::fs::read_to_string(to.path.join("bin/gcc")).unwrap(), "v2");
    }

    #[tokio::test]
    async fn update_reports_up_to_date() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/gcc-1.2.3.tar.gz")
            .with_body(tar_gz(&[("bin/gcc", "v1")]))
            .create_async()
            .await;
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, registry_for(server.url(), &["1.2.3"]), false);
        let spec = PackageSpec::parse(PackageKind::Tool, "toolchain-gcc").unwrap();
        manager.install(&spec, false).await.unwrap();

        let outcome = manager.update(&spec, None).await.unwrap();

        assert!(matches!(outcome, UpdateOutcome::UpToDate(pkg) if pkg.version() == "1.2.3"));
    }

    #[tokio::test]
    async fn external_uri_install_uses_descriptor_version() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/custom-tool.tar.gz")
            .with_body(tar_gz(&[(
                "custom-tool/package.json",
                r#"{"name": "custom-tool", "version": "3.1.0"}"#,
            )]))
            .create_async()
            .await;
        let temp_dir = TempDir::new().unwrap();
        let mut registry = MockRegistryClient::new();
        registry.expect_fetch_json_data().never();
        let manager = manager(&temp_dir, registry, false);
        let url = format!("{}/custom-tool.tar.gz", server.url());
        let spec = PackageSpec::parse(PackageKind::Tool, &url).unwrap();

        let pkg = manager.install(&spec, false).await.unwrap().into_package();

        assert!(pkg.is_external());
        assert_eq!(pkg.version(), "3.1.0");
        assert_eq!(pkg.manifest.source, url);
        assert!(pkg.manifest.slot.starts_with("custom-tool@"));
        assert_eq!(manager.find(&spec).unwrap(), Some(pkg));
    }

    #[tokio::test]
    async fn local_directory_install_copies_content() {
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("tool.sh"), "echo hi").unwrap();
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, MockRegistryClient::new(), false);
        let spec = PackageSpec::parse(
            PackageKind::Tool,
            &format!("mytool=file://{}", source.path().display()),
        )
        .unwrap();

        let pkg = manager.install(&spec, false).await.unwrap().into_package();

        assert_eq!(pkg.name(), "mytool");
        assert!(pkg.version().starts_with("0.0.0+sha256."));
        assert!(pkg.path.join("tool.sh").is_file());
        assert!(source.path().join("tool.sh").is_file());
    }

    #[tokio::test]
    async fn external_uri_update_downloads_changed_content() {
        let mut server = Server::new_async().await;
        let v1 = server
            .mock("GET", "/custom-tool.tar.gz")
            .with_body(tar_gz(&[(
                "custom-tool/package.json",
                r#"{"name": "custom-tool", "version": "3.1.0"}"#,
            )]))
            .expect(1)
            .create_async()
            .await;
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, MockRegistryClient::new(), false);
        let url = format!("{}/custom-tool.tar.gz", server.url());
        let spec = PackageSpec::parse(PackageKind::Tool, &url).unwrap();
        let installed = manager.install(&spec, false).await.unwrap().into_package();
        v1.assert_async().await;
        v1.remove_async().await;
        let v2 = server
            .mock("GET", "/custom-tool.tar.gz")
            .with_body(tar_gz(&[(
                "custom-tool/package.json",
                r#"{"name": "custom-tool", "version": "3.2.0"}"#,
            )]))
            .expect(1)
            .create_async()
            .await;

        let outcome = manager.update(&spec, None).await.unwrap();

        v2.assert_async().await;
        let UpdateOutcome::Updated { from, to } = outcome else {
            panic!("expected an update");
        };
        assert_eq!(from.version(), "3.1.0");
        assert_eq!(to.version(), "3.2.0");
        assert_eq!(to.manifest.slot, installed.manifest.slot);
        assert_eq!(manager.find(&spec).unwrap().unwrap().version(), "3.2.0");
        assert_ne!(to.checksum(), installed.checksum());
    }

    #[tokio::test]
    async fn local_directory_update_tracks_content() {
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("flash.sh"), "v1").unwrap();
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, MockRegistryClient::new(), false);
        let spec = PackageSpec::parse(
            PackageKind::Tool,
            &format!("tool-flash=file://{}", source.path().display()),
        )
        .unwrap();
        let installed = manager.install(&spec, false).await.unwrap().into_package();

        std::fs::write(source.path().join("flash.sh"), "v2").unwrap();
        let outcome = manager.update(&spec, None).await.unwrap();

        let UpdateOutcome::Updated { to, .. } = outcome else {
            panic!("expected an update");
        };
        assert!(to.version().starts_with("0.0.0+sha256."));
        assert_ne!(to.version(), installed.version());
        assert_eq!(to.manifest.slot, installed.manifest.slot);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_installs_of_one_spec_fetch_once() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/gcc-1.2.3.tar.gz")
            .with_body(tar_gz(&[("bin/gcc", "v1")]))
            .expect(1)
            .create_async()
            .await;
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, registry_for(server.url(), &["1.2.3"]), false);
        let spec = PackageSpec::parse(PackageKind::Tool, "toolchain-gcc").unwrap();

        let (first, second) = tokio::join!(manager.install(&spec, false), manager.install(&spec, false));
        let (first, second) = (first.unwrap(), second.unwrap());

        mock.assert_async().await;
        assert_eq!(first.package().manifest.slot, second.package().manifest.slot);
        assert_eq!(first.package().path, second.package().path);
        assert!(first.is_new() != second.is_new());
        assert_eq!(manager.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_to_other_spec_moves_to_new_slot() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/gcc-1.3.0.tar.gz")
            .with_body(tar_gz(&[("bin/gcc", "v1.3")]))
            .create_async()
            .await;
        server
            .mock("GET", "/gcc-1.4.0.tar.gz")
            .with_body(tar_gz(&[("bin/gcc", "v1.4")]))
            .create_async()
            .await;
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, registry_for(server.url(), &["1.3.0", "1.4.0"]), false);
        let from = PackageSpec::parse(PackageKind::Tool, "toolchain-gcc@1.3.0").unwrap();
        let to = PackageSpec::parse(PackageKind::Tool, "toolchain-gcc@^1.4.0").unwrap();
        let old = manager.install(&from, false).await.unwrap().into_package();

        let outcome = manager.update(&from, Some(&to)).await.unwrap();

        let UpdateOutcome::Updated { from: replaced, to: new } = outcome else {
            panic!("expected an update");
        };
        assert_eq!(replaced, old);
        assert_eq!(new.version(), "1.4.0");
        assert_ne!(new.manifest.slot, old.manifest.slot);
        assert!(new.path.is_dir());
        assert!(!old.path.exists());
        assert_eq!(manager.list().unwrap(), vec![new.clone()]);
        assert!(manager.find(&from).unwrap().is_none());
        assert_eq!(manager.find(&to).unwrap(), Some(new));
    }

    #[tokio::test]
    async fn unpack_retries_without_progress_after_io_failure() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("content");
        let calls = std::sync::Mutex::new(Vec::new());

        let result = unpack_with_fallback(
            &temp_dir.path().join("gcc.tar.gz"),
            &dest,
            true,
            |_, dest: PathBuf, with_progress| {
                calls.lock().unwrap().push(with_progress);
                async move {
                    if with_progress {
                        std::fs::create_dir_all(&dest).unwrap();
                        std::fs::write(dest.join("partial"), "half").unwrap();
                        return Err(PackageError::Unpack(UnpackError::Io(std::io::Error::other(
                            "disk hiccup",
                        ))));
                    }
                    assert!(!dest.exists(), "partial output must be cleared before retrying");
                    std::fs::create_dir_all(&dest).unwrap();
                    std::fs::write(dest.join("bin"), "ok").unwrap();
                    Ok(())
                }
            },
        )
        .await;

        result.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![true, false]);
        assert!(!dest.join("partial").exists());
        assert!(dest.join("bin").is_file());
    }

    #[tokio::test]
    async fn unpack_does_not_retry_format_errors() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("gcc.rar");
        let calls = std::sync::Mutex::new(Vec::new());

        let result = unpack_with_fallback(
            &archive,
            &temp_dir.path().join("content"),
            true,
            |archive: PathBuf, _, with_progress| {
                calls.lock().unwrap().push(with_progress);
                async move {
                    Err::<(), _>(PackageError::Unpack(UnpackError::UnsupportedArchive(archive)))
                }
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(PackageError::Unpack(UnpackError::UnsupportedArchive(_)))
        ));
        assert_eq!(*calls.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn prepare_rejects_spec_of_other_kind() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, MockRegistryClient::new(), false);
        let spec = PackageSpec::parse(PackageKind::Platform, "widgetplatform").unwrap();

        let result = manager.prepare(&spec, false).await;

        assert!(matches!(result, Err(PackageError::InvalidSpec { .. })));
    }
}
