//! Partially specified PostgreSQL versions (`major[.minor[.micro]]`).

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, TempDbError};

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)(?:\.(\d+)(?:\.(\d+))?)?").expect("valid version regex"));

/// A version with an optional minor and micro component.
///
/// Ordering treats an absent component as lower than any present one, so
/// `12 < 12.0 < 12.0.0 < 12.1`. Hint matching uses [`Version::matches`]
/// instead, where absent components are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    major: u32,
    minor: Option<u32>,
    micro: Option<u32>,
}

impl Version {
    /// Build a version, rejecting a micro component without a minor one.
    pub fn new(major: u32, minor: Option<u32>, micro: Option<u32>) -> Result<Self> {
        if micro.is_some() && minor.is_none() {
            return Err(TempDbError::InvalidVersion(
                "micro version must not be set if minor version is absent".to_string(),
            ));
        }
        Ok(Self {
            major,
            minor,
            micro,
        })
    }

    /// Major-only version.
    pub const fn major_only(major: u32) -> Self {
        Self {
            major,
            minor: None,
            micro: None,
        }
    }

    /// Parse the first version occurrence in free-form text, such as the
    /// output of `postgres --version`.
    pub fn parse(text: &str) -> Result<Self> {
        let caps = VERSION_RE
            .captures(text)
            .ok_or_else(|| TempDbError::parse(format!("{text:?} contains no version")))?;
        from_captures(&caps)
            .ok_or_else(|| TempDbError::parse(format!("{text:?} has an out of range version")))
    }

    /// Every non-overlapping version occurrence in `text`, in order.
    ///
    /// Occurrences whose components overflow `u32` are skipped.
    pub fn parse_all(text: &str) -> impl Iterator<Item = Version> + '_ {
        VERSION_RE
            .captures_iter(text)
            .filter_map(|caps| from_captures(&caps))
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> Option<u32> {
        self.minor
    }

    pub fn micro(&self) -> Option<u32> {
        self.micro
    }

    /// Progressively truncated versions, most specific first, down to the
    /// major-only version.
    pub fn variants(&self) -> Vec<Version> {
        let mut out = vec![*self];
        if self.micro.is_some() {
            out.push(Self {
                micro: None,
                ..*self
            });
        }
        if self.minor.is_some() {
            out.push(Self::major_only(self.major));
        }
        out
    }

    /// True if `candidate` satisfies `self` used as a hint: majors are equal
    /// and every component present in `self` equals the candidate's.
    pub fn matches(&self, candidate: &Version) -> bool {
        if self.major != candidate.major {
            return false;
        }
        if self.minor.is_some() && self.minor != candidate.minor {
            return false;
        }
        if self.micro.is_some() && self.micro != candidate.micro {
            return false;
        }
        true
    }
}

fn from_captures(caps: &Captures<'_>) -> Option<Version> {
    let component = |idx: usize| -> Option<Option<u32>> {
        match caps.get(idx) {
            Some(m) => m.as_str().parse().ok().map(Some),
            None => Some(None),
        }
    };
    let major = caps.get(1)?.as_str().parse().ok()?;
    let minor = component(2)?;
    let micro = component(3)?;
    Some(Version {
        major,
        minor,
        micro,
    })
}

impl From<u32> for Version {
    fn from(major: u32) -> Self {
        Self::major_only(major)
    }
}

impl FromStr for Version {
    type Err = TempDbError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{}", minor)?;
            if let Some(micro) = self.micro {
                write!(f, ".{}", micro)?;
            }
        }
        Ok(())
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reconstructs_present_components() {
        for text in ["12", "12.4", "12.4.1", "0", "9.6.24"] {
            assert_eq!(Version::parse(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_parse_finds_first_occurrence() {
        let v = Version::parse("postgres (PostgreSQL) 16.2 (Ubuntu 16.2-1.pgdg22.04+1)").unwrap();
        assert_eq!(v, Version::new(16, Some(2), None).unwrap());
    }

    #[test]
    fn test_parse_without_digits_fails() {
        assert!(matches!(
            Version::parse("postgres (PostgreSQL)"),
            Err(TempDbError::Parse(_))
        ));
        assert!(Version::parse("").is_err());
    }

    #[test]
    fn test_parse_overflow_fails() {
        assert!(Version::parse("99999999999").is_err());
    }

    #[test]
    fn test_parse_all_in_order() {
        let text = "versions 9.6.24, 12 and 16.2";
        let all: Vec<String> = Version::parse_all(text).map(|v| v.to_string()).collect();
        assert_eq!(all, vec!["9.6.24", "12", "16.2"]);

        // Restartable: a second scan yields the same sequence
        assert_eq!(Version::parse_all(text).count(), 3);
        assert_eq!(Version::parse_all("none here").count(), 0);
    }

    #[test]
    fn test_micro_without_minor_fails() {
        assert!(matches!(
            Version::new(1, None, Some(3)),
            Err(TempDbError::InvalidVersion(_))
        ));
        assert!(Version::new(1, Some(2), Some(3)).is_ok());
        assert!(Version::new(1, None, None).is_ok());
    }

    #[test]
    fn test_ordering_treats_absent_as_lowest() {
        let mut versions = vec![
            Version::new(12, Some(1), None).unwrap(),
            Version::from(12),
            Version::new(12, Some(0), Some(0)).unwrap(),
            Version::new(9, Some(6), Some(24)).unwrap(),
            Version::new(12, Some(0), None).unwrap(),
        ];
        versions.sort();
        let rendered: Vec<String> = versions.iter().map(|v| v.to_string()).collect();
        assert_eq!(rendered, vec!["9.6.24", "12", "12.0", "12.0.0", "12.1"]);
    }

    #[test]
    fn test_variants_most_specific_first() {
        let v = Version::new(12, Some(4), Some(1)).unwrap();
        let rendered: Vec<String> = v.variants().iter().map(|v| v.to_string()).collect();
        assert_eq!(rendered, vec!["12.4.1", "12.4", "12"]);

        let rendered: Vec<String> = Version::new(12, Some(4), None)
            .unwrap()
            .variants()
            .iter()
            .map(|v| v.to_string())
            .collect();
        assert_eq!(rendered, vec!["12.4", "12"]);

        assert_eq!(Version::from(12).variants(), vec![Version::from(12)]);
    }

    #[test]
    fn test_matches_uses_wildcards() {
        let installed = Version::new(16, Some(2), None).unwrap();
        assert!(Version::from(16).matches(&installed));
        assert!("16.2".parse::<Version>().unwrap().matches(&installed));
        assert!(!"16.3".parse::<Version>().unwrap().matches(&installed));
        assert!(!"16.2.1".parse::<Version>().unwrap().matches(&installed));
        assert!(!Version::from(1).matches(&installed));
    }

    #[test]
    fn test_serde_as_string() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            version: Version,
        }

        let wrapper: Wrapper = toml::from_str(r#"version = "14.11""#).unwrap();
        assert_eq!(wrapper.version.to_string(), "14.11");
        let text = toml::to_string(&wrapper).unwrap();
        assert!(text.contains("\"14.11\""));
    }
}
