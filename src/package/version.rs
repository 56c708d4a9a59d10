use anyhow::{Result, bail};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A Python version a package is built against, e.g. `3.6`.
///
/// Versions order numerically by component, so `3.10` sorts after `3.9`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PythonVersion {
    raw: String,
    parts: Vec<u32>,
}

impl PythonVersion {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Major and minor concatenated, as used in build strings (`3.6` -> `36`).
    pub fn compact(&self) -> String {
        self.raw.split('.').take(2).collect()
    }
}

impl FromStr for PythonVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        let parts = raw
            .split('.')
            .map(|p| p.parse::<u32>())
            .collect::<std::result::Result<Vec<u32>, _>>();
        match parts {
            Ok(parts) if (2..=3).contains(&parts.len()) => Ok(Self {
                raw: raw.to_string(),
                parts,
            }),
            _ => bail!(
                "Invalid Python version '{}': expected MAJOR.MINOR, e.g. 3.6",
                s
            ),
        }
    }
}

impl Ord for PythonVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts
            .cmp(&other.parts)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for PythonVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for PythonVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for PythonVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The package version a release tag stands for: the tag without a leading `v`.
pub fn version_from_tag(tag: &str) -> &str {
    tag.strip_prefix('v').unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> PythonVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_compact() {
        assert_eq!(v("3.6").compact(), "36");
        assert_eq!(v("2.7").compact(), "27");
        assert_eq!(v("3.10").compact(), "310");
        assert_eq!(v("3.6.5").compact(), "36");
        assert_eq!(v(" 3.6 ").as_str(), "3.6");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("3".parse::<PythonVersion>().is_err());
        assert!("three.six".parse::<PythonVersion>().is_err());
        assert!("3.6.1.2".parse::<PythonVersion>().is_err());
        assert!("".parse::<PythonVersion>().is_err());
    }

    #[test]
    fn test_numeric_ordering() {
        let mut versions = vec![v("3.10"), v("2.7"), v("3.6"), v("3.9")];
        versions.sort();
        let sorted: Vec<_> = versions.iter().map(|v| v.as_str()).collect();
        assert_eq!(sorted, vec!["2.7", "3.6", "3.9", "3.10"]);
    }

    #[test]
    fn test_serde_as_string() {
        let parsed: Vec<PythonVersion> = serde_json::from_str(r#"["3.6", "2.7"]"#).unwrap();
        assert_eq!(parsed, vec![v("3.6"), v("2.7")]);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), r#"["3.6","2.7"]"#);
        assert!(serde_json::from_str::<Vec<PythonVersion>>(r#"["py3"]"#).is_err());
    }

    #[test]
    fn test_version_from_tag() {
        assert_eq!(version_from_tag("v2.0"), "2.0");
        assert_eq!(version_from_tag("0.13.0"), "0.13.0");
        assert_eq!(version_from_tag("vv1"), "v1");
    }
}
