//! Firmware version normalization
//!
//! Miner firmware reports its version in whatever shape the vendor felt like
//! that year: `"1.2.3"`, `"v21.4"`, `"firmware-9"`, `"4.9.0.1-rc2"`, or
//! nothing at all. This module coerces any of those into a plain
//! `major.minor.patch` [`semver::Version`] so versions can be compared and
//! displayed uniformly. Normalization never fails; input without usable
//! digits degrades to `0.0.0`.

use semver::Version;

/// Version reported when nothing usable could be extracted
pub fn unknown() -> Version {
    Version::new(0, 0, 0)
}

/// Normalize a raw version string into a canonical `major.minor.patch`.
///
/// The input is split on `.`; each segment keeps only its ASCII digits and
/// segments without digits are dropped (not zero-filled), so `"a.2.3"`
/// behaves exactly like `"2.3"`. One or two remaining segments are padded
/// with zeros, more than three are truncated.
///
/// Examples:
/// - `None` / `""` / `"abc"` -> `0.0.0`
/// - `"9"` -> `9.0.0`
/// - `"v21.4"` -> `21.4.0`
/// - `"1.2.3.4.5"` -> `1.2.3`
pub fn normalize(raw: Option<&str>) -> Version {
    let Some(raw) = raw.filter(|s| !s.is_empty()) else {
        return unknown();
    };

    let numeric: Vec<String> = raw
        .split('.')
        .map(|segment| segment.chars().filter(char::is_ascii_digit).collect::<String>())
        .filter(|digits| !digits.is_empty())
        .collect();

    let components = match numeric.as_slice() {
        [] => return unknown(),
        [major] => [major.as_str(), "0", "0"],
        [major, minor] => [major.as_str(), minor.as_str(), "0"],
        [major, minor, patch, ..] => [major.as_str(), minor.as_str(), patch.as_str()],
    };

    build(components).unwrap_or_else(unknown)
}

/// Shorthand for [`normalize`] on a present string
pub fn normalize_str(raw: &str) -> Version {
    normalize(Some(raw))
}

// Digit runs longer than u64 allows are the only way this can fail.
fn build([major, minor, patch]: [&str; 3]) -> Option<Version> {
    Some(Version::new(
        major.parse().ok()?,
        minor.parse().ok()?,
        patch.parse().ok()?,
    ))
}
