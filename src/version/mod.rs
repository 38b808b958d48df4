// src/version/mod.rs

//! Version ordering for arbitrary vendor version strings
//!
//! Vendor versions rarely follow semver: build numbers, letter suffixes and
//! mixed separators are common ("19.42.2.24335", "2.0b3", "1.2-rc.1"). A
//! [`VersionKey`] splits a version string into typed segments and provides a
//! total order over them:
//!
//! - Segments are separated by runs of non-alphanumeric characters
//! - A segment is a number when it parses as an integer, otherwise a
//!   lowercased text token
//! - A missing segment compares as the number 0
//! - Numbers sort before text at the same position

pub mod lock;

pub use lock::{is_locked, LockPattern};

use std::cmp::Ordering;
use std::convert::Infallible;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// One typed component of a version string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Number(u64),
    Text(String),
}

impl Segment {
    fn compare(&self, other: &Segment) -> Ordering {
        match (self, other) {
            (Segment::Number(a), Segment::Number(b)) => a.cmp(b),
            (Segment::Text(a), Segment::Text(b)) => a.cmp(b),
            (Segment::Number(_), Segment::Text(_)) => Ordering::Less,
            (Segment::Text(_), Segment::Number(_)) => Ordering::Greater,
        }
    }

    fn is_zero(&self) -> bool {
        matches!(self, Segment::Number(0))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Number(n) => write!(f, "{}", n),
            Segment::Text(s) => write!(f, "{}", s),
        }
    }
}

const ZERO: Segment = Segment::Number(0);

/// A parsed, comparable version
///
/// Equality follows the ordering, not the source text: "1.02", "1.2" and
/// "1.2.0" are all equal.
#[derive(Debug, Clone, Default)]
pub struct VersionKey {
    segments: Vec<Segment>,
}

impl VersionKey {
    /// Parse a version string. Never fails; an empty string yields no segments.
    pub fn parse(s: &str) -> Self {
        let segments = s
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(|token| match token.parse::<u64>() {
                Ok(n) => Segment::Number(n),
                Err(_) => Segment::Text(token.to_lowercase()),
            })
            .collect();

        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Join the first `n` segments, zero-padding positions past the end
    ///
    /// `VersionKey::parse("1.2").to_string_padded(4)` is "1.2.0.0".
    pub fn to_string_padded(&self, n: usize) -> String {
        (0..n)
            .map(|i| self.segments.get(i).unwrap_or(&ZERO).to_string())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Segments with trailing zeros removed; equal keys share this form
    fn significant(&self) -> &[Segment] {
        let end = self
            .segments
            .iter()
            .rposition(|s| !s.is_zero())
            .map_or(0, |i| i + 1);
        &self.segments[..end]
    }
}

impl Ord for VersionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).unwrap_or(&ZERO);
            let b = other.segments.get(i).unwrap_or(&ZERO);
            match a.compare(b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for VersionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for VersionKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VersionKey {}

impl Hash for VersionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let significant = self.significant();
        significant.len().hash(state);
        for segment in significant {
            match segment {
                Segment::Number(n) => {
                    0u8.hash(state);
                    n.hash(state);
                }
                Segment::Text(s) => {
                    1u8.hash(state);
                    s.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_padded(self.segments.len()))
    }
}

impl FromStr for VersionKey {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// Compare two raw version strings
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    VersionKey::parse(a).cmp(&VersionKey::parse(b))
}
