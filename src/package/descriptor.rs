use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::package::spec::PackageKind;

/// Descriptor files that may declare a package's name and version, most
/// specific first
fn descriptor_files(kind: PackageKind) -> [&'static str; 3] {
    match kind {
        PackageKind::Platform => ["platform.json", "package.json", "library.json"],
        PackageKind::Library => ["library.json", "package.json", "platform.json"],
        PackageKind::Tool => ["package.json", "library.json", "platform.json"],
    }
}

/// Name and version a package declares about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PackageDescriptor {
    pub name: Option<String>,
    pub version: Option<String>,
}

impl PackageDescriptor {
    /// Read the first descriptor found in a package root.
    /// Malformed descriptors are skipped with a warning.
    pub fn read(dir: &Path, kind: PackageKind) -> Option<Self> {
        descriptor_files(kind).into_iter().find_map(|file| {
            let path = dir.join(file);
            let content = std::fs::read_to_string(&path).ok()?;
            match serde_json::from_str::<PackageDescriptor>(&content) {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    warn!("Ignoring malformed descriptor {:?}: {}", path, e);
                    None
                }
            }
        })
    }
}
