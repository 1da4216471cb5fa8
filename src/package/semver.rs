use semver::Version;

/// Parse a version string into a semver::Version, normalizing partial versions.
///
/// Handles partial versions like "1" or "1.2" by padding with zeros and
/// tolerates a leading `v`.
///
/// Examples:
/// - "1" -> Version(1, 0, 0)
/// - "1.2" -> Version(1, 2, 0)
/// - "v1.2.3" -> Version(1, 2, 3)
pub fn parse_version(version: &str) -> Option<Version> {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    let core_end = version.find(['-', '+']).unwrap_or(version.len());
    let (core, suffix) = version.split_at(core_end);
    let parts: Vec<&str> = core.split('.').collect();
    let normalized = match parts.as_slice() {
        [major] => format!("{}.0.0{}", major, suffix),
        [major, minor] => format!("{}.{}.0{}", major, minor, suffix),
        _ => version.to_string(),
    };
    Version::parse(&normalized).ok()
}

/// Select the highest version from `candidates` accepted by `accept`.
///
/// Unparseable entries are skipped. Returns the original item, not the
/// parsed version, so callers keep their metadata.
pub fn highest_matching<'a, T, F>(
    candidates: impl IntoIterator<Item = &'a T>,
    version_of: impl Fn(&T) -> &str,
    accept: F,
) -> Option<&'a T>
where
    T: 'a,
    F: Fn(&Version) -> bool,
{
    candidates
        .into_iter()
        .filter_map(|candidate| {
            let parsed = parse_version(version_of(candidate))?;
            accept(&parsed).then_some((candidate, parsed))
        })
        .max_by(|(_, a), (_, b)| a.cmp(b))
        .map(|(candidate, _)| candidate)
}
