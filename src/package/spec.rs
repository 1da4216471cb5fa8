//! Package specifiers
//!
//! A specifier string names either a registry package
//! (`[owner/]name[@requirement]`) or an external source located by URI,
//! version control reference or local path (`[name=]locator`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PackageError;
use crate::package::range::VersionRange;
use crate::package::semver::parse_version;

static REGISTRY_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<owner>[A-Za-z0-9_.\-]+)/)?(?P<name>[A-Za-z0-9_.\-]+)(?:@(?P<req>.*))?$")
        .expect("registry specifier pattern is valid")
});

/// Length of the hex prefix used for slot signatures
const SIGNATURE_LEN: usize = 10;

/// Kind of package, each kind lives in its own store root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Platform,
    Tool,
    Library,
}

impl PackageKind {
    /// Returns the string representation used by the registry API
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Platform => "platform",
            PackageKind::Tool => "tool",
            PackageKind::Library => "library",
        }
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PackageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "platform" => Ok(PackageKind::Platform),
            "tool" => Ok(PackageKind::Tool),
            "library" => Ok(PackageKind::Library),
            other => Err(format!("unknown package kind '{}'", other)),
        }
    }
}

/// What a specifier asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Wildcard,
    Exact(Version),
    Range(VersionRange),
    /// Direct archive URL
    Uri(String),
    /// Version control repository with an optional ref (branch, tag or commit)
    Vcs { url: String, reference: Option<String> },
    LocalPath(PathBuf),
}

impl Requirement {
    /// Whether a concrete version satisfies this requirement.
    /// External requirements are matched by locator, never by version.
    pub fn matches_version(&self, version: &Version) -> bool {
        match self {
            Requirement::Wildcard => true,
            Requirement::Exact(v) => v == version,
            Requirement::Range(range) => range.matches(version),
            Requirement::Uri(_) | Requirement::Vcs { .. } | Requirement::LocalPath(_) => false,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Requirement::Uri(_) | Requirement::Vcs { .. } | Requirement::LocalPath(_)
        )
    }

    /// Source locator string for external requirements
    pub fn locator(&self) -> Option<String> {
        match self {
            Requirement::Uri(url) => Some(url.clone()),
            Requirement::Vcs { url, reference } => Some(match reference {
                Some(r) => format!("git+{}#{}", url, r),
                None => format!("git+{}", url),
            }),
            Requirement::LocalPath(path) => Some(format!("file://{}", path.display())),
            _ => None,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Wildcard => f.write_str("*"),
            Requirement::Exact(v) => write!(f, "{}", v),
            Requirement::Range(range) => write!(f, "{}", range),
            external => f.write_str(&external.locator().unwrap_or_default()),
        }
    }
}

/// A parsed package requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub kind: PackageKind,
    pub owner: Option<String>,
    /// Empty for external specs whose name is only known after fetching
    pub name: String,
    pub requirement: Requirement,
}

impl PackageSpec {
    /// Parse a specifier string for the given kind
    pub fn parse(kind: PackageKind, input: &str) -> Result<Self, PackageError> {
        let input = input.trim();
        let invalid = |reason: &str| PackageError::InvalidSpec {
            spec: input.to_string(),
            reason: reason.to_string(),
        };
        if input.is_empty() {
            return Err(invalid("empty specifier"));
        }

        // `name=locator` gives an external source an explicit name
        let (explicit_name, body) = match input.split_once('=') {
            Some((name, rest))
                if !name.is_empty()
                    && !name.contains(['/', '@', ':', '<', '>', '^', '~'])
                    && looks_external(rest) =>
            {
                (Some(name.to_string()), rest)
            }
            _ => (None, input),
        };

        if let Some(requirement) = parse_external(body) {
            let name = explicit_name.unwrap_or_else(|| name_from_locator(&requirement));
            return Ok(Self {
                kind,
                owner: None,
                name,
                requirement,
            });
        }

        let captures = REGISTRY_SPEC
            .captures(body)
            .ok_or_else(|| invalid("expected [owner/]name[@requirement]"))?;
        let owner = captures.name("owner").map(|m| m.as_str().to_string());
        let name = captures["name"].to_string();
        let requirement = match captures.name("req").map(|m| m.as_str().trim()) {
            None | Some("") | Some("*") | Some("latest") => Requirement::Wildcard,
            Some(raw) => parse_version_requirement(raw).ok_or_else(|| invalid("bad version"))?,
        };

        Ok(Self {
            kind,
            owner,
            name,
            requirement,
        })
    }

    /// Registry spec for a name and requirement string, as declared by a platform
    pub fn registry(
        kind: PackageKind,
        owner: Option<&str>,
        name: &str,
        requirement: &str,
    ) -> Result<Self, PackageError> {
        let text = match owner {
            Some(owner) => format!("{}/{}@{}", owner, name, requirement),
            None => format!("{}@{}", name, requirement),
        };
        Self::parse(kind, &text)
    }

    pub fn is_external(&self) -> bool {
        self.requirement.is_external()
    }

    /// Slot signature: None for the default slot (wildcard registry specs),
    /// otherwise a short digest of the requirement or source locator.
    pub fn signature(&self) -> Option<String> {
        match &self.requirement {
            Requirement::Wildcard => None,
            Requirement::Exact(v) => Some(short_digest(&format!("={}", v))),
            Requirement::Range(range) => Some(short_digest(range.as_str())),
            external => external.locator().map(|locator| short_digest(&locator)),
        }
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_external() {
            if self.name.is_empty() {
                return write!(f, "{}", self.requirement);
            }
            return write!(f, "{}={}", self.name, self.requirement);
        }
        if let Some(owner) = &self.owner {
            write!(f, "{}/", owner)?;
        }
        match &self.requirement {
            Requirement::Wildcard => write!(f, "{}", self.name),
            requirement => write!(f, "{}@{}", self.name, requirement),
        }
    }
}

/// Hex digest prefix used for slot signatures and content-derived versions
pub fn short_digest(input: &str) -> String {
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    digest[..SIGNATURE_LEN].to_string()
}

fn looks_external(input: &str) -> bool {
    parse_external(input).is_some()
}

fn parse_external(input: &str) -> Option<Requirement> {
    if let Some(rest) = input.strip_prefix("git+") {
        let (url, reference) = split_reference(rest);
        return Some(Requirement::Vcs { url, reference });
    }
    if input.starts_with("http://") || input.starts_with("https://") {
        let (base, _) = split_reference(input);
        if base.ends_with(".git") {
            let (url, reference) = split_reference(input);
            return Some(Requirement::Vcs { url, reference });
        }
        return Some(Requirement::Uri(input.to_string()));
    }
    if let Some(path) = input.strip_prefix("file://") {
        return Some(Requirement::LocalPath(PathBuf::from(path)));
    }
    if input.starts_with('/') || input.starts_with("./") || input.starts_with("../") {
        return Some(Requirement::LocalPath(PathBuf::from(input)));
    }
    if let Some(rest) = input.strip_prefix("~/") {
        let home = dirs::home_dir()?;
        return Some(Requirement::LocalPath(home.join(rest)));
    }
    None
}

fn split_reference(url: &str) -> (String, Option<String>) {
    match url.split_once('#') {
        Some((base, reference)) if !reference.is_empty() => {
            (base.to_string(), Some(reference.to_string()))
        }
        Some((base, _)) => (base.to_string(), None),
        None => (url.to_string(), None),
    }
}

fn parse_version_requirement(raw: &str) -> Option<Requirement> {
    let is_plain_version = raw
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == 'v')
        && !raw.contains([' ', 'x', 'X', '*', '|']);
    if is_plain_version && let Some(version) = parse_version(raw) {
        return Some(Requirement::Exact(version));
    }
    VersionRange::parse(raw).map(|range| {
        if range.is_any() {
            Requirement::Wildcard
        } else {
            Requirement::Range(range)
        }
    })
}

/// Best-effort package name from a source locator
fn name_from_locator(requirement: &Requirement) -> String {
    let raw = match requirement {
        Requirement::Uri(url) | Requirement::Vcs { url, .. } => {
            url.trim_end_matches('/').rsplit('/').next().unwrap_or("").to_string()
        }
        Requirement::LocalPath(path) => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        _ => String::new(),
    };
    strip_archive_suffix(Path::new(&raw))
}

fn strip_archive_suffix(file: &Path) -> String {
    let name = file.to_string_lossy();
    let name = name.split(['?', '#']).next().unwrap_or_default();
    for suffix in [
        ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".tar", ".zip", ".git",
    ] {
        if let Some(stem) = name.strip_suffix(suffix) {
            return stem.to_string();
        }
    }
    name.to_string()
}
