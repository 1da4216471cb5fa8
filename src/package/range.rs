//! Version range requirements
//!
//! Supports the range syntax accepted in package specifiers:
//! - `1.2.3` - exact match
//! - `^1.2.3` - compatible with version (>=1.2.3 <2.0.0)
//! - `~1.2.3` - approximately equivalent (>=1.2.3 <1.3.0)
//! - `>=1.2.3`, `>1.2.3`, `<=1.2.3`, `<1.2.3` - comparison operators
//! - `1.2.x`, `1.x`, `*` - wildcards
//! - `>=1.0.0 <2.0.0` - AND, `^1.0.0 || ^2.0.0` - OR, `1.0.0 - 2.0.0` - hyphen

use std::fmt;

use semver::Version;

use crate::package::semver::parse_version;

/// A parsed version range, keeping the text it was parsed from
#[derive(Debug, Clone)]
pub struct VersionRange {
    raw: String,
    expr: RangeExpr,
}

impl PartialEq for VersionRange {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for VersionRange {}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl VersionRange {
    /// Parse a range expression; returns None for malformed input
    pub fn parse(spec: &str) -> Option<Self> {
        let raw = spec.split_whitespace().collect::<Vec<_>>().join(" ");
        RangeExpr::parse(&raw).map(|expr| Self { raw, expr })
    }

    /// Check whether a version falls inside this range
    pub fn matches(&self, version: &Version) -> bool {
        self.expr.satisfies(version)
    }

    /// Whether this range accepts any version
    pub fn is_any(&self) -> bool {
        matches!(self.expr, RangeExpr::Single(Comparator::Any))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Top-level range expression
/// Handles compound ranges (AND, OR) as well as simple comparators
#[derive(Debug, Clone)]
enum RangeExpr {
    Single(Comparator),
    /// space-separated, all must satisfy
    And(Vec<RangeExpr>),
    /// `||`-separated, any must satisfy
    Or(Vec<RangeExpr>),
}

impl RangeExpr {
    fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }

        if spec.contains("||") {
            let exprs: Option<Vec<RangeExpr>> =
                spec.split("||").map(Self::parse_and_or_single).collect();
            return exprs.map(RangeExpr::Or);
        }

        Self::parse_and_or_single(spec)
    }

    fn parse_and_or_single(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }

        if let Some(hyphen) = Comparator::parse_hyphen(spec) {
            return Some(RangeExpr::Single(hyphen));
        }

        let parts = Self::split_and_parts(spec);
        if parts.len() > 1 {
            let comparators: Option<Vec<RangeExpr>> = parts
                .into_iter()
                .map(|p| Comparator::parse(&p).map(RangeExpr::Single))
                .collect();
            comparators.map(RangeExpr::And)
        } else {
            Comparator::parse(spec).map(RangeExpr::Single)
        }
    }

    /// Split on whitespace, re-attaching operators written apart from their
    /// version (`>= 1.0.0` is one comparator)
    fn split_and_parts(spec: &str) -> Vec<String> {
        let mut parts: Vec<String> = Vec::new();
        let mut pending_operator: Option<&str> = None;

        for token in spec.split_whitespace() {
            if matches!(token, ">=" | "<=" | ">" | "<" | "^" | "~" | "=") {
                pending_operator = Some(token);
                continue;
            }
            match pending_operator.take() {
                Some(op) => parts.push(format!("{}{}", op, token)),
                None => parts.push(token.to_string()),
            }
        }

        parts
    }

    fn satisfies(&self, version: &Version) -> bool {
        match self {
            RangeExpr::Single(comparator) => comparator.satisfies(version),
            RangeExpr::And(exprs) => exprs.iter().all(|e| e.satisfies(version)),
            RangeExpr::Or(exprs) => exprs.iter().any(|e| e.satisfies(version)),
        }
    }
}

#[derive(Debug, Clone)]
enum Comparator {
    Exact(Version),
    /// ^1.2.3 means >=1.2.3 <2.0.0 (or special cases for 0.x)
    Caret(Version),
    /// ~1.2.3 means >=1.2.3 <1.3.0
    Tilde(Version),
    Gte(Version),
    Gt(Version),
    Lte(Version),
    Lt(Version),
    Any,
    /// 1.x means >=1.0.0 <2.0.0
    WildcardMajor(u64),
    /// 1.2.x means >=1.2.0 <1.3.0
    WildcardMinor(u64, u64),
    /// 1.0.0 - 2.0.0 means >=1.0.0 <=2.0.0
    Hyphen { from: Version, to: Version },
}

impl Comparator {
    fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();

        if let Some(rest) = spec.strip_prefix(">=") {
            parse_version(rest).map(Comparator::Gte)
        } else if let Some(rest) = spec.strip_prefix('>') {
            parse_version(rest).map(Comparator::Gt)
        } else if let Some(rest) = spec.strip_prefix("<=") {
            parse_version(rest).map(Comparator::Lte)
        } else if let Some(rest) = spec.strip_prefix('<') {
            parse_version(rest).map(Comparator::Lt)
        } else if let Some(rest) = spec.strip_prefix('^') {
            parse_version(rest).map(Comparator::Caret)
        } else if let Some(rest) = spec.strip_prefix('~') {
            parse_version(rest.trim_start_matches('=')).map(Comparator::Tilde)
        } else if let Some(rest) = spec.strip_prefix('=') {
            parse_version(rest).map(Comparator::Exact)
        } else if spec == "*" || spec.eq_ignore_ascii_case("x") {
            Some(Comparator::Any)
        } else if let Some(wildcard) = Self::parse_wildcard(spec) {
            Some(wildcard)
        } else {
            parse_version(spec).map(Comparator::Exact)
        }
    }

    fn parse_hyphen(spec: &str) -> Option<Self> {
        let (from, to) = spec.split_once(" - ")?;
        let from = parse_version(from)?;
        let to = parse_version(to)?;
        Some(Comparator::Hyphen { from, to })
    }

    fn parse_wildcard(spec: &str) -> Option<Self> {
        let is_wild = |s: &str| s == "*" || s.eq_ignore_ascii_case("x");
        let parts: Vec<&str> = spec.split('.').collect();

        match parts.as_slice() {
            [major, x] | [major, x, _] if is_wild(x) => {
                major.parse::<u64>().ok().map(Comparator::WildcardMajor)
            }
            [major, minor, x] if is_wild(x) => {
                let major = major.parse::<u64>().ok()?;
                let minor = minor.parse::<u64>().ok()?;
                Some(Comparator::WildcardMinor(major, minor))
            }
            _ => None,
        }
    }

    fn satisfies(&self, version: &Version) -> bool {
        match self {
            Comparator::Exact(v) => version == v,
            Comparator::Caret(v) => {
                if version < v {
                    return false;
                }
                if v.major == 0 {
                    if v.minor == 0 {
                        version.major == 0 && version.minor == 0 && version.patch == v.patch
                    } else {
                        version.major == 0 && version.minor == v.minor
                    }
                } else {
                    version.major == v.major
                }
            }
            Comparator::Tilde(v) => {
                version >= v && version.major == v.major && version.minor == v.minor
            }
            Comparator::Gte(v) => version >= v,
            Comparator::Gt(v) => version > v,
            Comparator::Lte(v) => version <= v,
            Comparator::Lt(v) => version < v,
            Comparator::Any => true,
            Comparator::WildcardMajor(major) => version.major == *major,
            Comparator::WildcardMinor(major, minor) => {
                version.major == *major && version.minor == *minor
            }
            Comparator::Hyphen { from, to } => version >= from && version <= to,
        }
    }
}
