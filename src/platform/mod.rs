//! Platforms: installed platform packages seen through their descriptor
//!
//! A platform is always constructed from an [`InstalledPackage`] handed out
//! by the store (committed or staged), never from an arbitrary directory.

mod board;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::error::{PackageError, PackageResult};
use crate::package::manifest::InstalledPackage;
use crate::package::range::VersionRange;
use crate::package::spec::{PackageKind, PackageSpec};

pub use board::{BoardConfig, load_boards};

const PLATFORM_DESCRIPTOR: &str = "platform.json";

/// A package a platform needs to build for its boards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredDependency {
    pub name: String,
    pub kind: PackageKind,
    pub owner: Option<String>,
    /// Version requirement or external locator
    pub requirement: String,
    pub optional: bool,
}

impl DeclaredDependency {
    pub fn spec(&self) -> PackageResult<PackageSpec> {
        let named_external = format!("{}={}", self.name, self.requirement);
        match PackageSpec::parse(self.kind, &named_external) {
            Ok(spec) if spec.is_external() => Ok(spec),
            _ => PackageSpec::registry(
                self.kind,
                self.owner.as_deref(),
                &self.name,
                &self.requirement,
            ),
        }
    }
}

/// Domain view of an installed platform
#[cfg_attr(test, automock)]
pub trait Platform: Send + Sync {
    /// Toolchains, frameworks and other packages the platform requires
    fn declared_dependencies(&self) -> Vec<DeclaredDependency>;

    /// Engine versions the platform supports; None means any
    fn compatible_engine_range(&self) -> Option<VersionRange>;

    fn boards(&self) -> PackageResult<Vec<BoardConfig>>;

    /// Invoked once after the platform was committed for the first time
    fn on_installed(&self) -> PackageResult<()>;

    /// Invoked once after the platform was removed from the store
    fn on_uninstalled(&self) -> PackageResult<()>;
}

/// Builds the domain object for an installed platform package
#[cfg_attr(test, automock)]
pub trait PlatformFactory: Send + Sync {
    fn construct(&self, package: &InstalledPackage) -> PackageResult<Box<dyn Platform>>;
}

/// `platform.json` contents
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformDescriptor {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub engines: Engines,
    #[serde(default)]
    pub packages: IndexMap<String, PackageDeclaration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Engines {
    pub core: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageDeclaration {
    /// toolchain, framework, uploader, debugger, library, ...
    #[serde(rename = "type", default)]
    pub package_type: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default = "any_version")]
    pub version: String,
    #[serde(default)]
    pub optional: bool,
}

fn any_version() -> String {
    "*".to_string()
}

/// Platform backed by the `platform.json` descriptor in the package root
pub struct DescriptorPlatform {
    package: InstalledPackage,
    descriptor: PlatformDescriptor,
    engine_range: Option<VersionRange>,
}

impl DescriptorPlatform {
    pub fn load(package: &InstalledPackage) -> PackageResult<Self> {
        let path = package.path.join(PLATFORM_DESCRIPTOR);
        let invalid = |message: String| PackageError::InvalidDescriptor {
            path: path.clone(),
            message,
        };

        let content = std::fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
        let descriptor: PlatformDescriptor =
            serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        let engine_range = match descriptor.engines.core.as_deref() {
            None => None,
            Some(raw) => Some(
                VersionRange::parse(raw)
                    .ok_or_else(|| invalid(format!("invalid engine range '{}'", raw)))?,
            ),
        };

        Ok(Self {
            package: package.clone(),
            descriptor,
            engine_range,
        })
    }

    pub fn descriptor(&self) -> &PlatformDescriptor {
        &self.descriptor
    }
}

impl Platform for DescriptorPlatform {
    fn declared_dependencies(&self) -> Vec<DeclaredDependency> {
        self.descriptor
            .packages
            .iter()
            .map(|(name, declaration)| DeclaredDependency {
                name: name.clone(),
                kind: match declaration.package_type.as_deref() {
                    Some("library") => PackageKind::Library,
                    _ => PackageKind::Tool,
                },
                owner: declaration.owner.clone(),
                requirement: declaration.version.clone(),
                optional: declaration.optional,
            })
            .collect()
    }

    fn compatible_engine_range(&self) -> Option<VersionRange> {
        self.engine_range.clone()
    }

    fn boards(&self) -> PackageResult<Vec<BoardConfig>> {
        load_boards(&self.package.path, self.package.name())
    }

    fn on_installed(&self) -> PackageResult<()> {
        info!(
            "Platform {} {} has been installed",
            self.descriptor.name,
            self.package.version()
        );
        Ok(())
    }

    fn on_uninstalled(&self) -> PackageResult<()> {
        info!(
            "Platform {} {} has been uninstalled",
            self.descriptor.name,
            self.package.version()
        );
        Ok(())
    }
}

/// Default factory reading `platform.json`
#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptorPlatformFactory;

impl PlatformFactory for DescriptorPlatformFactory {
    fn construct(&self, package: &InstalledPackage) -> PackageResult<Box<dyn Platform>> {
        Ok(Box::new(DescriptorPlatform::load(package)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::manifest::fixtures::manifest;
    use crate::package::spec::Requirement;
    use semver::Version;
    use tempfile::TempDir;

    fn installed(dir: &TempDir, descriptor: &str) -> InstalledPackage {
        std::fs::write(dir.path().join(PLATFORM_DESCRIPTOR), descriptor).unwrap();
        InstalledPackage {
            manifest: manifest(PackageKind::Platform, "widgetplatform", "2.3.1"),
            path: dir.path().to_path_buf(),
        }
    }

    #[test]
    fn descriptor_declares_dependencies_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let pkg = installed(
            &temp_dir,
            r#"{
                "name": "widgetplatform",
                "version": "2.3.1",
                "engines": {"core": ">=2.0.0"},
                "packages": {
                    "toolchain-widget": {"type": "toolchain", "owner": "acme", "version": "~1.2.0"},
                    "framework-core": {"type": "framework", "optional": true},
                    "lib-helpers": {"type": "library", "version": "git+https://e.com/h.git#v1"}
                }
            }"#,
        );

        let platform = DescriptorPlatform::load(&pkg).unwrap();
        let deps = platform.declared_dependencies();

        let names: Vec<&str> = deps.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["toolchain-widget", "framework-core", "lib-helpers"]);
        assert!(deps[1].optional);
        assert_eq!(deps[1].requirement, "*");
        assert_eq!(deps[2].kind, PackageKind::Library);

        let range = platform.compatible_engine_range().unwrap();
        assert!(range.matches(&Version::new(2, 5, 0)));
    }

    #[test]
    fn declared_dependency_specs_cover_registry_and_external() {
        let registry = DeclaredDependency {
            name: "toolchain-widget".to_string(),
            kind: PackageKind::Tool,
            owner: Some("acme".to_string()),
            requirement: "~1.2.0".to_string(),
            optional: false,
        };
        let external = DeclaredDependency {
            requirement: "https://e.com/tool.tar.gz".to_string(),
            owner: None,
            ..registry.clone()
        };

        let spec = registry.spec().unwrap();
        assert_eq!(spec.to_string(), "acme/toolchain-widget@~1.2.0");

        let spec = external.spec().unwrap();
        assert_eq!(spec.name, "toolchain-widget");
        assert!(matches!(spec.requirement, Requirement::Uri(_)));
    }

    #[test]
    fn invalid_engine_range_is_descriptor_error() {
        let temp_dir = TempDir::new().unwrap();
        let pkg = installed(
            &temp_dir,
            r#"{"name": "widgetplatform", "engines": {"core": ">=banana"}}"#,
        );

        let result = DescriptorPlatformFactory.construct(&pkg);

        assert!(matches!(result, Err(PackageError::InvalidDescriptor { .. })));
    }

    #[test]
    fn missing_descriptor_is_descriptor_error() {
        let temp_dir = TempDir::new().unwrap();
        let pkg = InstalledPackage {
            manifest: manifest(PackageKind::Platform, "widgetplatform", "2.3.1"),
            path: temp_dir.path().to_path_buf(),
        };

        assert!(matches!(
            DescriptorPlatform::load(&pkg),
            Err(PackageError::InvalidDescriptor { .. })
        ));
    }
}
