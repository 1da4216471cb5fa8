//! Local package store
//!
//! One store root per package kind. Every committed package lives in its own
//! slot directory (`name` or `name@signature`) holding the package files and
//! a manifest. The directory scan is the only source of truth: nothing is
//! remembered between calls.
//!
//! Slots are only ever mutated by renaming a freshly written directory into
//! place. Replacing an occupied slot moves the old directory to a
//! `.backup-<slot>` sibling first, which readers serve until the new
//! directory is in place, so a slot is never observed empty.

mod lock;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::package::manifest::{InstalledPackage, Manifest};
use crate::package::semver::highest_matching;
use crate::package::spec::{PackageKind, PackageSpec};

pub use lock::SlotLock;

const STAGING_PREFIX: &str = ".staging-";
const BACKUP_PREFIX: &str = ".backup-";
const REMOVING_PREFIX: &str = ".removing-";
const STAGED_CONTENT_DIR: &str = "package";

/// Staging directories younger than this may belong to a running install
const STALE_STAGING_AGE: Duration = Duration::from_secs(60 * 60);

/// A directory in the store root that is not a valid package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptEntry {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of scanning a store root
#[derive(Debug, Default)]
pub struct StoreScan {
    pub packages: Vec<InstalledPackage>,
    pub corrupt: Vec<CorruptEntry>,
}

/// Private working area for one install, invisible to `list()` until committed
#[derive(Debug)]
pub struct Staging {
    root: PathBuf,
    content: PathBuf,
}

impl Staging {
    /// Directory the package content must be materialized into
    pub fn content_dir(&self) -> &Path {
        &self.content
    }

    /// Scratch space next to the content directory, removed with the staging area
    pub fn scratch_dir(&self) -> &Path {
        &self.root
    }
}

#[derive(Debug, Clone)]
pub struct LocalPackageStore {
    kind: PackageKind,
    root: PathBuf,
    locks_dir: PathBuf,
}

impl LocalPackageStore {
    /// Lock files live in `locks_dir`, outside the store root, so failed
    /// installs leave nothing behind under `root`
    pub fn new(kind: PackageKind, root: impl Into<PathBuf>, locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            root: root.into(),
            locks_dir: locks_dir.into(),
        }
    }

    pub fn kind(&self) -> PackageKind {
        self.kind
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Slot directory name a spec installs into
    pub fn slot_for(spec: &PackageSpec) -> String {
        match spec.signature() {
            Some(signature) => format!("{}@{}", spec.name, signature),
            None => spec.name.clone(),
        }
    }

    fn backup_path(&self, slot: &str) -> PathBuf {
        self.root.join(format!("{}{}", BACKUP_PREFIX, slot))
    }

    /// Block until the slot lock is held. Call from a blocking context.
    pub fn lock_slot(&self, slot: &str) -> Result<SlotLock, StoreError> {
        Ok(SlotLock::acquire(&self.locks_dir, slot)?)
    }

    /// Scan the store root for packages and corrupt entries
    pub fn scan(&self) -> Result<StoreScan, StoreError> {
        let mut scan = StoreScan::default();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scan),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            if let Some(slot) = dir_name.strip_prefix(BACKUP_PREFIX) {
                backups.push((slot.to_string(), entry.path()));
                continue;
            }
            if dir_name.starts_with('.') {
                continue;
            }

            match self.read_slot(&entry.path(), &dir_name) {
                Ok(pkg) => scan.packages.push(pkg),
                Err(reason) => scan.corrupt.push(CorruptEntry {
                    path: entry.path(),
                    reason,
                }),
            }
        }

        // A backup stands in for its slot only while the slot itself is missing
        for (slot, path) in backups {
            if self.root.join(&slot).exists() {
                continue;
            }
            if let Ok(pkg) = self.read_slot(&path, &slot) {
                debug!("Serving {:?} from backup", slot);
                scan.packages.push(pkg);
            }
        }

        scan.packages.sort_by(|a, b| a.manifest.slot.cmp(&b.manifest.slot));
        Ok(scan)
    }

    fn read_slot(&self, path: &Path, slot: &str) -> Result<InstalledPackage, String> {
        let manifest = Manifest::read_from(path).map_err(|e| e.to_string())?;
        if manifest.slot != slot {
            return Err(format!(
                "manifest belongs to slot '{}', found in '{}'",
                manifest.slot, slot
            ));
        }
        if manifest.kind != self.kind {
            return Err(format!("manifest kind '{}' in {} store", manifest.kind, self.kind));
        }
        Ok(InstalledPackage {
            manifest,
            path: path.to_path_buf(),
        })
    }

    /// Installed packages; corrupt entries are logged and excluded
    pub fn list(&self) -> Result<Vec<InstalledPackage>, StoreError> {
        let scan = self.scan()?;
        for entry in &scan.corrupt {
            warn!("Ignoring corrupt package directory {:?}: {}", entry.path, entry.reason);
        }
        Ok(scan.packages)
    }

    /// Best installed package satisfying the spec
    pub fn find(&self, spec: &PackageSpec) -> Result<Option<InstalledPackage>, StoreError> {
        let candidates: Vec<InstalledPackage> = self
            .list()?
            .into_iter()
            .filter(|pkg| pkg.satisfies(spec))
            .collect();

        if spec.is_external() {
            let slot = Self::slot_for(spec);
            let preferred = candidates
                .iter()
                .position(|pkg| pkg.manifest.slot == slot)
                .unwrap_or(0);
            return Ok(candidates.into_iter().nth(preferred));
        }

        Ok(highest_matching(&candidates, |pkg| pkg.version(), |_| true).cloned())
    }

    /// Package currently occupying a slot, falling back to its backup
    pub fn get(&self, slot: &str) -> Option<InstalledPackage> {
        self.read_slot(&self.root.join(slot), slot)
            .or_else(|_| self.read_slot(&self.backup_path(slot), slot))
            .ok()
    }

    /// Create a private staging area for one install
    pub fn begin_install(&self, spec: &PackageSpec) -> Result<Staging, StoreError> {
        std::fs::create_dir_all(&self.root)?;
        let root = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.root)?
            .keep();
        debug!("Staging {} in {:?}", spec, root);
        Ok(Staging {
            content: root.join(STAGED_CONTENT_DIR),
            root,
        })
    }

    /// Move a staged package into its slot.
    ///
    /// The manifest is written into the staged content first, so the slot
    /// directory appears with its manifest in a single rename. Requires the
    /// slot lock.
    pub fn commit(
        &self,
        lock: &SlotLock,
        staging: Staging,
        manifest: Manifest,
    ) -> Result<InstalledPackage, StoreError> {
        let slot = manifest.slot.clone();
        if lock.slot() != slot {
            return Err(StoreError::InvalidManifest {
                path: staging.content.clone(),
                message: format!("slot '{}' committed under lock for '{}'", slot, lock.slot()),
            });
        }
        if !staging.content.is_dir() {
            return Err(StoreError::MissingStaging(staging.content));
        }

        manifest.write_to(&staging.content)?;

        let target = self.root.join(&slot);
        let backup = self.backup_path(&slot);
        if target.exists() {
            if backup.exists() {
                std::fs::remove_dir_all(&backup)?;
            }
            std::fs::rename(&target, &backup)?;
            debug!("Moved previous {:?} aside", slot);
        }

        if let Err(e) = std::fs::rename(&staging.content, &target) {
            if backup.exists() && !target.exists() {
                restore_backup(&backup, &target);
            }
            return Err(e.into());
        }

        if backup.exists()
            && let Err(e) = std::fs::remove_dir_all(&backup)
        {
            warn!("Failed to remove backup {:?}: {}", backup, e);
        }
        self.remove_staging_root(&staging.root);

        info!("Committed {} {} into {:?}", manifest.name, manifest.version, target);
        Ok(InstalledPackage {
            manifest,
            path: target,
        })
    }

    /// Abandon a staged install without touching any slot
    pub fn discard(&self, staging: Staging) -> Result<(), StoreError> {
        debug!("Discarding staging area {:?}", staging.root);
        match std::fs::remove_dir_all(&staging.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a committed package. Requires the slot lock.
    ///
    /// The slot is renamed out of view before deletion, so `list()` never
    /// sees a half-deleted package.
    pub fn remove(&self, lock: &SlotLock, pkg: &InstalledPackage) -> Result<(), StoreError> {
        let slot = pkg.manifest.slot.as_str();
        let parent_ok = pkg.path.parent() == Some(self.root.as_path());
        if !parent_ok || lock.slot() != slot {
            return Err(StoreError::ForeignPath(pkg.path.clone()));
        }

        for path in [self.root.join(slot), self.backup_path(slot)] {
            if !path.exists() {
                continue;
            }
            let doomed = self.root.join(format!(
                "{}{}-{}",
                REMOVING_PREFIX,
                slot,
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
            ));
            std::fs::rename(&path, &doomed)?;
            if let Err(e) = std::fs::remove_dir_all(&doomed) {
                warn!("Failed to delete {:?}, will retry on prune: {}", doomed, e);
            }
        }

        info!("Removed {} {} from {:?}", pkg.name(), pkg.version(), self.root);
        Ok(())
    }

    /// Delete abandoned staging areas, stale backups and corrupt entries
    pub fn prune_orphans(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut removed = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let dir_name = entry.file_name().to_string_lossy().to_string();
            let orphaned = if dir_name.starts_with(STAGING_PREFIX) {
                is_older_than(&path, STALE_STAGING_AGE)
            } else if dir_name.starts_with(REMOVING_PREFIX) {
                true
            } else if let Some(slot) = dir_name.strip_prefix(BACKUP_PREFIX) {
                self.root.join(slot).exists()
            } else {
                false
            };
            if orphaned {
                std::fs::remove_dir_all(&path)?;
                removed.push(path);
            }
        }

        for corrupt in self.scan()?.corrupt {
            info!("Pruning corrupt entry {:?}: {}", corrupt.path, corrupt.reason);
            std::fs::remove_dir_all(&corrupt.path)?;
            removed.push(corrupt.path);
        }

        Ok(removed)
    }

    fn remove_staging_root(&self, root: &Path) {
        if let Err(e) = std::fs::remove_dir_all(root) {
            warn!("Failed to remove staging area {:?}: {}", root, e);
        }
    }
}

fn is_older_than(path: &Path, age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|elapsed| elapsed >= age)
}

/// Move a backup back into its slot after a failed commit. Returns whether
/// the slot was restored; a stranded backup is still served by `find`.
fn restore_backup(backup: &Path, target: &Path) -> bool {
    match std::fs::rename(backup, target) {
        Ok(()) => {
            debug!("Restored {:?} from {:?}", target, backup);
            true
        }
        Err(e) => {
            warn!("Failed to restore {:?} from {:?}: {}", target, backup, e);
            false
        }
    }
}
