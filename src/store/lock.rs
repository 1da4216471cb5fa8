//! Slot-scoped advisory locks
//!
//! One lock file per slot under `<core>/.locks/<kind>/`, so unrelated packages can
//! be committed concurrently while two processes never write the same slot.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs4::FileExt;
use tracing::debug;

/// Held for as long as the slot is being mutated; released on drop
#[derive(Debug)]
pub struct SlotLock {
    _file: File,
    slot: String,
    path: PathBuf,
}

impl SlotLock {
    /// Block until the slot lock is acquired
    pub fn acquire(locks_dir: &Path, slot: &str) -> std::io::Result<Self> {
        let (file, path) = Self::open(locks_dir, slot)?;
        file.lock_exclusive()?;
        debug!("Acquired slot lock {:?}", path);
        Ok(Self {
            _file: file,
            slot: slot.to_string(),
            path,
        })
    }

    /// Acquire the slot lock only if nobody else holds it
    pub fn try_acquire(locks_dir: &Path, slot: &str) -> std::io::Result<Option<Self>> {
        let (file, path) = Self::open(locks_dir, slot)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                _file: file,
                slot: slot.to_string(),
                path,
            })),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    fn open(locks_dir: &Path, slot: &str) -> std::io::Result<(File, PathBuf)> {
        std::fs::create_dir_all(locks_dir)?;
        let path = locks_dir.join(format!("{}.lock", slot));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok((file, path))
    }
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        debug!("Released slot lock {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn try_acquire_fails_while_slot_is_held() {
        let temp_dir = TempDir::new().unwrap();

        let held = SlotLock::acquire(temp_dir.path(), "toolchain-gcc").unwrap();
        let second = SlotLock::try_acquire(temp_dir.path(), "toolchain-gcc").unwrap();
        assert!(second.is_none());

        drop(held);
        let third = SlotLock::try_acquire(temp_dir.path(), "toolchain-gcc").unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn different_slots_do_not_contend() {
        let temp_dir = TempDir::new().unwrap();

        let _a = SlotLock::acquire(temp_dir.path(), "toolchain-gcc").unwrap();
        let b = SlotLock::try_acquire(temp_dir.path(), "framework-core").unwrap();

        assert_eq!(b.map(|lock| lock.slot().to_string()).as_deref(), Some("framework-core"));
    }
}
