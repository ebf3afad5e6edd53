//! Version ordering used by the manifest query service and the agent's
//! update decision. Versions that fail to parse sort strictly below any
//! parsable version; pre-releases order per semver rules.

use std::cmp::Ordering;

use semver::Version;

/// Parse a version string, tolerating a leading `v`.
pub fn parse(raw: &str) -> Option<Version> {
    Version::parse(raw.trim().trim_start_matches('v')).ok()
}

/// Compare two version strings.
///
/// Parsable beats unparsable; two unparsable strings (and exact semver ties)
/// fall back to lexicographic comparison of the raw strings so the ordering
/// stays total and deterministic.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (parse(a), parse(b)) {
        (Some(va), Some(vb)) => match va.cmp(&vb) {
            Ordering::Equal => a.cmp(b),
            other => other,
        },
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// Is `candidate` strictly newer than `current`?
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare(candidate, current) == Ordering::Greater
}

/// Derive the `MAJOR.MINOR` line from a version string. Prerelease and build
/// metadata after `-` or `+` are discarded.
pub fn minor_line(version: &str) -> String {
    let bare = version
        .trim()
        .trim_start_matches('v')
        .split(['-', '+'])
        .next()
        .unwrap_or("");
    let mut parts = bare.split('.');
    let major = parts.next().unwrap_or("0");
    let minor = parts.next().unwrap_or("0");
    format!("{}.{}", major, minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_basics() {
        assert!(is_newer("0.2.0", "0.1.0"));
        assert!(is_newer("1.0.0", "0.9.9"));
        assert!(!is_newer("0.1.0", "0.1.0"));
        assert!(!is_newer("0.1.0", "0.2.0"));
    }

    #[test]
    fn prerelease_sorts_below_release() {
        assert!(is_newer("1.0.0", "1.0.0-rc.1"));
        assert!(is_newer("1.0.0-rc.2", "1.0.0-rc.1"));
        assert!(!is_newer("2.0.0-beta", "2.0.0"));
    }

    #[test]
    fn unparsable_sorts_below_parsable() {
        assert_eq!(compare("garbage", "0.0.1"), Ordering::Less);
        assert_eq!(compare("0.0.1", "garbage"), Ordering::Greater);
        // Two unparsable strings stay lexicographic.
        assert_eq!(compare("abc", "abd"), Ordering::Less);
    }

    #[test]
    fn leading_v_tolerated() {
        assert!(is_newer("v1.2.0", "1.1.9"));
    }

    #[test]
    fn minor_line_derivation() {
        assert_eq!(minor_line("1.2.3"), "1.2");
        assert_eq!(minor_line("v2.0.1-rc.1"), "2.0");
        assert_eq!(minor_line("3.4.0+build.7"), "3.4");
        assert_eq!(minor_line("5"), "5.0");
    }
}
