//! Appliance version tags
//!
//! Appliance builds report dotted numeric versions (`5.3.2.7`), optionally with a
//! pre-release suffix (`5.5.0.0-beta1`) that sorts after the bare numeric parts.
//! Upstream builds report `master`, which maps to [`VersionTag::Latest`] and
//! sorts after every numeric version.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::str::FromStr;

/// A comparable appliance version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionTag {
    Numeric {
        parts: Vec<u32>,
        suffix: Option<String>,
    },
    Latest,
}

impl VersionTag {
    /// Parse a version string. Anything starting with `master` is the upstream sentinel.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.to_ascii_lowercase().starts_with("master") || trimmed == "latest" {
            return Ok(VersionTag::Latest);
        }
        let invalid = || Error::InvalidVersion(raw.to_string());
        let (numeric, suffix) = match trimmed.split_once('-') {
            Some((numeric, suffix)) => (numeric, Some(suffix)),
            None => (trimmed, None),
        };
        let parts = numeric
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;
        if suffix.is_some_and(|s| s.is_empty() || s.contains(char::is_whitespace)) {
            return Err(invalid());
        }
        Ok(VersionTag::Numeric {
            parts,
            suffix: suffix.map(str::to_string),
        })
    }

    /// Plain numeric version
    pub fn numeric(parts: impl Into<Vec<u32>>) -> Self {
        VersionTag::Numeric {
            parts: parts.into(),
            suffix: None,
        }
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, VersionTag::Latest)
    }

    /// Whether this version belongs to `series`, e.g. `5.2.5.2` is in `5.2`.
    /// The upstream sentinel is only in its own series.
    pub fn is_in_series(&self, series: &VersionTag) -> bool {
        match (self, series) {
            (VersionTag::Latest, VersionTag::Latest) => true,
            (
                VersionTag::Numeric { parts: own, .. },
                VersionTag::Numeric {
                    parts: prefix,
                    suffix: None,
                },
            ) => own.len() >= prefix.len() && own[..prefix.len()] == prefix[..],
            (own, series) => own == series,
        }
    }

    /// Convenience over [`VersionTag::is_in_series`] taking a string series
    pub fn in_series(&self, series: &str) -> bool {
        VersionTag::parse(series)
            .map(|s| self.is_in_series(&s))
            .unwrap_or(false)
    }

    /// First `n` components, e.g. `5.3` for `5.3.2.7`
    pub fn series(&self, n: usize) -> VersionTag {
        match self {
            VersionTag::Latest => VersionTag::Latest,
            VersionTag::Numeric { parts, suffix } if n >= parts.len() => VersionTag::Numeric {
                parts: parts.clone(),
                suffix: suffix.clone(),
            },
            VersionTag::Numeric { parts, .. } => VersionTag::numeric(&parts[..n]),
        }
    }

    /// Numeric parts as digits, used for generated VM names (`5.3.2.7` -> `5327`)
    pub fn digits(&self) -> String {
        match self {
            VersionTag::Latest => String::new(),
            VersionTag::Numeric { parts, .. } => parts.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Strict comparison against a version string; invalid strings never compare less
    pub fn is_older_than(&self, other: &str) -> bool {
        VersionTag::parse(other)
            .map(|o| *self < o)
            .unwrap_or(false)
    }
}

impl Ord for VersionTag {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (VersionTag::Latest, VersionTag::Latest) => Ordering::Equal,
            (VersionTag::Latest, _) => Ordering::Greater,
            (_, VersionTag::Latest) => Ordering::Less,
            (
                VersionTag::Numeric { parts: a, suffix: a_suffix },
                VersionTag::Numeric { parts: b, suffix: b_suffix },
            ) => a.cmp(b).then_with(|| a_suffix.cmp(b_suffix)),
        }
    }
}

impl PartialOrd for VersionTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for VersionTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        VersionTag::parse(s)
    }
}

impl std::fmt::Display for VersionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionTag::Latest => write!(f, "master"),
            VersionTag::Numeric { parts, suffix } => {
                let rendered: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "{}", rendered.join("."))?;
                match suffix {
                    Some(suffix) => write!(f, "-{}", suffix),
                    None => Ok(()),
                }
            }
        }
    }
}

impl Serialize for VersionTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // YAML happily reads `5.3` as a float, so accept any scalar
        let value = serde_yaml::Value::deserialize(deserializer)?;
        let raw = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected a version string, got {:?}",
                    other
                )))
            }
        };
        VersionTag::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> VersionTag {
        VersionTag::parse(s).unwrap()
    }

    #[test]
    fn test_total_order() {
        assert!(v("5.2.1.8") < v("5.3"));
        assert!(v("5.3") < v("5.3.1.0"));
        assert!(v("5.3.1.0") < VersionTag::Latest);
        assert!(v("99.99.99") < VersionTag::Latest);
        assert_eq!(VersionTag::Latest.cmp(&VersionTag::Latest), Ordering::Equal);
    }

    #[test]
    fn test_master_is_latest() {
        assert_eq!(v("master"), VersionTag::Latest);
        assert_eq!(v("MASTER\n"), VersionTag::Latest);
        assert_eq!(v("master.20150101"), VersionTag::Latest);
        assert_eq!(VersionTag::Latest.to_string(), "master");
    }

    #[test]
    fn test_series() {
        assert!(v("5.2.5.2").in_series("5.2"));
        assert!(!v("5.3.0.1").in_series("5.2"));
        assert!(!VersionTag::Latest.in_series("5.3"));
        assert!(VersionTag::Latest.is_in_series(&VersionTag::Latest));
        assert_eq!(v("5.3.2.7").series(2), v("5.3"));
    }

    #[test]
    fn test_digits_and_trim() {
        assert_eq!(v(" 5.3.2.7\n").digits(), "5327");
        assert!(VersionTag::parse("5.x").is_err());
        assert!(VersionTag::parse("").is_err());
    }

    #[test]
    fn test_deserialize_from_yaml_float() {
        let parsed: VersionTag = serde_yaml::from_str("5.3").unwrap();
        assert_eq!(parsed, v("5.3"));
        let parsed: VersionTag = serde_yaml::from_str("'5.2.5.1'").unwrap();
        assert_eq!(parsed, v("5.2.5.1"));
    }

    #[test]
    fn test_prerelease_suffix() {
        let beta = v("5.5.0.0-beta1");
        assert_eq!(beta.to_string(), "5.5.0.0-beta1");
        assert!(v("5.5.0.0") < beta);
        assert!(beta < v("5.5.0.0-beta2"));
        assert!(beta < v("5.5.0.1"));
        assert!(beta < VersionTag::Latest);
        assert!(beta.in_series("5.5"));
        assert!(!beta.in_series("5.5.0.0-beta2"));
        assert_eq!(beta.series(2), v("5.5"));
        assert_eq!(beta.series(4), beta);
        assert_eq!(beta.digits(), "5500");
        assert!(!beta.is_older_than("5.5"));
        assert!(VersionTag::parse("5.5-").is_err());
        assert!(VersionTag::parse("-beta1").is_err());
    }

    #[test]
    fn test_is_older_than() {
        assert!(v("5.2.5").is_older_than("5.3"));
        assert!(!v("5.3.0.0").is_older_than("5.3"));
        assert!(!VersionTag::Latest.is_older_than("5.3"));
    }
}
