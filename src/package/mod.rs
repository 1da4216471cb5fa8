pub mod descriptor;
pub mod manifest;
pub mod range;
pub mod resolver;
pub mod semver;
pub mod spec;

pub use manifest::{InstalledPackage, Manifest};
pub use resolver::{RemoteArtifact, Resolution, Resolver};
pub use spec::{PackageKind, PackageSpec, Requirement};
