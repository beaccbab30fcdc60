//! Dotted version comparison and compatibility ranges.
//!
//! Versions are dot-separated unsigned integers (`"1.2"`, `"1.2.0"`).
//! Comparison is component-wise with missing components treated as `0`,
//! so `"1.2" == "1.2.0"`. Ranges are a comparator followed by a version:
//! `>=1.2.0`, `>1.0`, `<=2`, `<3.0.0`, `==1.5.0`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::errors::{ProtocolError, Result};

/// A parsed dotted version.
#[derive(Clone, Debug, Eq)]
pub struct Version {
    parts: Vec<u64>,
}

impl Version {
    /// Parse a dotted version string. Surrounding whitespace and a leading
    /// `v` are ignored.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(ProtocolError::InvalidVersion(input.to_string()));
        }
        let parts = trimmed
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| ProtocolError::InvalidVersion(input.to_string()))?;
        Ok(Self { parts })
    }

    fn component(&self, idx: usize) -> u64 {
        self.parts.get(idx).copied().unwrap_or(0)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .parts
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        f.write_str(&joined)
    }
}

impl FromStr for Version {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Range comparator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparator {
    /// `>=`
    Gte,
    /// `>`
    Gt,
    /// `<=`
    Lte,
    /// `<`
    Lt,
    /// `==`
    Eq,
}

impl Comparator {
    fn symbol(self) -> &'static str {
        match self {
            Self::Gte => ">=",
            Self::Gt => ">",
            Self::Lte => "<=",
            Self::Lt => "<",
            Self::Eq => "==",
        }
    }
}

/// A single `comparator + version` requirement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionRange {
    /// How to compare.
    pub comparator: Comparator,
    /// The version to compare against.
    pub version: Version,
}

impl VersionRange {
    /// Parse a range such as `">=1.2.0"`.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        // Two-character comparators must be tried first.
        let table = [
            (">=", Comparator::Gte),
            ("<=", Comparator::Lte),
            ("==", Comparator::Eq),
            (">", Comparator::Gt),
            ("<", Comparator::Lt),
        ];
        let (comparator, rest) = table
            .iter()
            .find_map(|(sym, cmp)| trimmed.strip_prefix(sym).map(|rest| (*cmp, rest)))
            .ok_or_else(|| ProtocolError::InvalidRange(input.to_string()))?;
        let version =
            Version::parse(rest).map_err(|_| ProtocolError::InvalidRange(input.to_string()))?;
        Ok(Self { comparator, version })
    }

    /// Whether `candidate` satisfies this range.
    pub fn matches(&self, candidate: &Version) -> bool {
        let ord = candidate.cmp(&self.version);
        match self.comparator {
            Comparator::Gte => ord != Ordering::Less,
            Comparator::Gt => ord == Ordering::Greater,
            Comparator::Lte => ord != Ordering::Greater,
            Comparator::Lt => ord == Ordering::Less,
            Comparator::Eq => ord == Ordering::Equal,
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.comparator.symbol(), self.version)
    }
}

/// Check `current` against every range (logical AND).
///
/// An empty range list is compatible. Any unparseable range or an
/// unparseable `current` version makes the result an error, which callers
/// treat as incompatible.
pub fn check_compatible<S: AsRef<str>>(current: &str, ranges: &[S]) -> Result<bool> {
    if ranges.is_empty() {
        return Ok(true);
    }
    let current = Version::parse(current)?;
    for raw in ranges {
        let range = VersionRange::parse(raw.as_ref())?;
        if !range.matches(&current) {
            return Ok(false);
        }
    }
    Ok(true)
}
