//! Monotonically comparable version tokens
//!
//! Versions are dotted numeric tokens (`"3"`, `"1.4.2"`, `"v2.0"`). Plain
//! logical counters and semantic versions share one ordering: components are
//! compared left to right and a missing component counts as zero, so `"2"`
//! and `"2.0"` are the same version.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a version token cannot be parsed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid version token {token:?}: {reason}")]
pub struct VersionParseError {
    pub token: String,
    pub reason: &'static str,
}

/// A version token with counter or semantic-version ordering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    parts: Vec<u64>,
}

impl Version {
    /// Create a counter-style version
    pub fn counter(value: u64) -> Self {
        Self { parts: vec![value] }
    }

    /// Create a semantic version
    pub fn semantic(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            parts: vec![major, minor, patch],
        }
    }

    /// The version that directly supersedes this one.
    ///
    /// Only the last component is bumped, so `1.4.2` becomes `1.4.3` and a
    /// counter `7` becomes `8`.
    pub fn next(&self) -> Self {
        let mut parts = self.parts.clone();
        if let Some(last) = parts.last_mut() {
            *last = last.saturating_add(1);
        }
        Self { parts }
    }

    /// The higher of two versions (the left one on equality)
    pub fn max_of<'a>(a: &'a Version, b: &'a Version) -> &'a Version {
        if b > a {
            b
        } else {
            a
        }
    }

    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    fn component(&self, index: usize) -> u64 {
        self.parts.get(index).copied().unwrap_or(0)
    }

    fn significant_len(&self) -> usize {
        self.parts
            .iter()
            .rposition(|part| *part != 0)
            .map_or(0, |idx| idx + 1)
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::counter(0)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|idx| self.component(idx).cmp(&other.component(idx)))
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // trailing zeros do not participate in equality
        self.parts[..self.significant_len()].hash(state);
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        if body.is_empty() {
            return Err(VersionParseError {
                token: s.to_string(),
                reason: "empty token",
            });
        }

        let parts = body
            .split('.')
            .map(|part| {
                part.parse::<u64>().map_err(|_| VersionParseError {
                    token: s.to_string(),
                    reason: "components must be unsigned integers",
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { parts })
    }
}

impl TryFrom<String> for Version {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self::counter(value)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.parts.iter().map(u64::to_string).collect();
        write!(f, "{}", rendered.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_ordering() {
        assert!(Version::counter(3) > Version::counter(2));
        assert_eq!(Version::counter(3), "3".parse().unwrap());
    }

    #[test]
    fn test_semantic_ordering_pads_missing_components() {
        let a: Version = "1.2".parse().unwrap();
        let b: Version = "1.2.0".parse().unwrap();
        let c: Version = "v1.10.0".parse().unwrap();

        assert_eq!(a, b);
        assert!(c > a);
        assert_eq!(Version::max_of(&a, &c), &c);
    }

    #[test]
    fn test_next_supersedes() {
        let v: Version = "1.4.2".parse().unwrap();
        assert_eq!(v.next().to_string(), "1.4.3");
        assert!(v.next() > v);
    }

    #[test]
    fn test_invalid_tokens() {
        assert!("".parse::<Version>().is_err());
        assert!("1.x".parse::<Version>().is_err());
        assert!("v".parse::<Version>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let v = Version::semantic(2, 0, 1);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"2.0.1\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
