//! Release Version Handling
//!
//! Semantic version triples parsed from release tags. Malformed tags are
//! rejected, never coerced into a "best effort" version.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version tag '{0}': expected MAJOR.MINOR.PATCH")]
    Malformed(String),
    #[error("Invalid version component '{component}' in tag '{tag}'")]
    BadComponent { tag: String, component: String },
}

/// A totally ordered (major, minor, patch) version triple.
///
/// Ordering is lexicographic over the triple, which the derived `Ord`
/// provides. A leading `v` on the tag is accepted and stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The version this binary was built as.
    pub fn current() -> Self {
        // CARGO_PKG_VERSION is always a valid triple
        env!("CARGO_PKG_VERSION")
            .parse()
            .unwrap_or(Self::new(0, 0, 0))
    }

    /// Parse a release tag, accepting an optional leading `v`.
    pub fn parse_tag(tag: &str) -> Result<Self, VersionError> {
        tag.trim().trim_start_matches('v').parse()
    }

    pub fn as_tuple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(VersionError::Malformed(s.to_string()));
        }

        let mut nums = [0u32; 3];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(VersionError::BadComponent {
                    tag: s.to_string(),
                    component: (*part).to_string(),
                });
            }
            *slot = part.parse().map_err(|_| VersionError::BadComponent {
                tag: s.to_string(),
                component: (*part).to_string(),
            })?;
        }

        Ok(Self::new(nums[0], nums[1], nums[2]))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Check whether `latest` is strictly newer than `current`.
///
/// `None` for `current` means no prior version is installed, which compares
/// lower than any published version.
pub fn is_newer(current: Option<Version>, latest: Version) -> bool {
    match current {
        Some(cur) => latest > cur,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_v_prefixed() {
        assert_eq!(Version::parse_tag("1.2.3").unwrap(), Version::new(1, 2, 3));
        assert_eq!(Version::parse_tag("v0.10.0").unwrap(), Version::new(0, 10, 0));
        assert_eq!(Version::parse_tag(" v2.0.1 ").unwrap(), Version::new(2, 0, 1));
    }

    #[test]
    fn test_malformed_tags_rejected() {
        assert!(Version::parse_tag("1.2").is_err());
        assert!(Version::parse_tag("1.2.3.4").is_err());
        assert!(Version::parse_tag("1.2.x").is_err());
        assert!(Version::parse_tag("latest").is_err());
        assert!(Version::parse_tag("1..3").is_err());
        assert!(Version::parse_tag("-1.2.3").is_err());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        assert!(Version::new(1, 0, 0) > Version::new(0, 9, 9));
        assert!(Version::new(0, 2, 0) > Version::new(0, 1, 9));
        assert!(Version::new(0, 1, 1) > Version::new(0, 1, 0));
        assert_eq!(Version::new(1, 2, 3), Version::new(1, 2, 3));
    }

    #[test]
    fn test_ordering_transitive() {
        let a = Version::new(0, 1, 0);
        let b = Version::new(0, 2, 0);
        let c = Version::new(1, 0, 0);
        assert!(a < b && b < c);
        assert!(a < c);
    }

    #[test]
    fn test_no_prior_version_is_older_than_anything() {
        assert!(is_newer(None, Version::new(0, 0, 1)));
        assert!(is_newer(Some(Version::new(1, 2, 0)), Version::new(1, 3, 0)));
        assert!(!is_newer(Some(Version::new(1, 3, 0)), Version::new(1, 3, 0)));
        assert!(!is_newer(Some(Version::new(1, 3, 0)), Version::new(1, 2, 9)));
    }

    #[test]
    fn test_display_roundtrip() {
        let v = Version::new(3, 14, 1);
        assert_eq!(v.to_string().parse::<Version>().unwrap(), v);
    }
}
