// src/version/lock.rs

//! Version lock patterns
//!
//! A lock pattern pins publishing to a version line, e.g. `19.42.2.x` only
//! admits builds of 19.42.2. Each run of `x` (either case) stands for one or
//! more digits; everything else is literal and the whole version must match.

use crate::error::{Error, Result};
use regex::Regex;

/// A compiled, anchored lock pattern
#[derive(Debug, Clone)]
pub struct LockPattern {
    pattern: String,
    regex: Regex,
}

impl LockPattern {
    /// Compile a lock pattern into an anchored matcher
    pub fn compile(pattern: &str) -> Result<Self> {
        let mut source = String::from("^");
        let mut literal = String::new();
        let mut in_wildcard = false;

        for c in pattern.chars() {
            if c == 'x' || c == 'X' {
                if !in_wildcard {
                    source.push_str(&regex::escape(&literal));
                    literal.clear();
                    source.push_str(r"\d+");
                    in_wildcard = true;
                }
            } else {
                literal.push(c);
                in_wildcard = false;
            }
        }
        source.push_str(&regex::escape(&literal));
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| Error::InvalidLockPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Whether `version` fully matches the pattern
    pub fn matches(&self, version: &str) -> bool {
        self.regex.is_match(version)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

/// Check whether `version` is blocked from publishing by `pattern`
///
/// An absent or blank pattern never locks.
pub fn is_locked(version: &str, pattern: Option<&str>) -> Result<bool> {
    match pattern.map(str::trim) {
        None | Some("") => Ok(false),
        Some(p) => Ok(!LockPattern::compile(p)?.matches(version)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_build_is_not_locked() {
        assert!(!is_locked("19.42.2.24335", Some("19.42.2.x")).unwrap());
    }

    #[test]
    fn test_other_line_is_locked() {
        assert!(is_locked("19.42.3.442", Some("19.42.2.x")).unwrap());
    }

    #[test]
    fn test_empty_pattern_never_locks() {
        for v in ["", "1.0", "anything at all"] {
            assert!(!is_locked(v, Some("")).unwrap());
            assert!(!is_locked(v, Some("   ")).unwrap());
            assert!(!is_locked(v, None).unwrap());
        }
    }

    #[test]
    fn test_dots_are_literal() {
        let p = LockPattern::compile("1.2.x").unwrap();
        assert!(p.matches("1.2.7"));
        assert!(!p.matches("1x2.7"));
        assert!(!p.matches("102.7"));
    }

    #[test]
    fn test_anchored_both_ends() {
        let p = LockPattern::compile("2.x").unwrap();
        assert!(!p.matches("12.5"));
        assert!(!p.matches("2.5.1"));
        assert!(p.matches("2.512"));
    }

    #[test]
    fn test_wildcard_run_and_case() {
        let p = LockPattern::compile("3.XX.x").unwrap();
        assert_eq!(p.as_str(), "3.XX.x");
        assert!(p.matches("3.1.0"));
        assert!(p.matches("3.100.42"));
        assert!(!p.matches("3..0"));
    }

    #[test]
    fn test_wildcard_requires_digits() {
        let p = LockPattern::compile("5.x").unwrap();
        assert!(!p.matches("5.beta"));
        assert!(!p.matches("5."));
    }
}
