// src/family.rs

//! Application families
//!
//! A family is every version object of one logical application: the current
//! object carries the bare display name, older ones carry an ordinal suffix
//! `"<name> (N-k)"`. Families are not stored anywhere; they are rebuilt from
//! a directory query and sorted newest first.

use crate::directory::{AppId, AppVersionObject, DirectoryService};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use std::cmp::Ordering;
use tracing::{debug, info};

/// Display name of the object `k` versions behind current
pub fn ordinal_name(name: &str, k: usize) -> String {
    if k == 0 {
        name.to_string()
    } else {
        format!("{} (N-{})", name, k)
    }
}

/// Ordinal slot encoded in `display_name`
///
/// Returns `Some(0)` for the bare name, `Some(k)` for `"<name> (N-k)"` and
/// `None` for names outside the family.
pub fn parse_ordinal(name: &str, display_name: &str) -> Option<usize> {
    if display_name == name {
        return Some(0);
    }
    let digits = display_name
        .strip_prefix(name)?
        .strip_prefix(" (N-")?
        .strip_suffix(')')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|k| *k > 0)
}

/// Family order: higher version first, then newer creation time
pub fn newest_first(a: &AppVersionObject, b: &AppVersionObject) -> Ordering {
    b.version_key()
        .cmp(&a.version_key())
        .then_with(|| b.created_at.cmp(&a.created_at))
}

/// Sorted view of one logical application's version objects
#[derive(Debug, Clone)]
pub struct Family {
    name: String,
    members: Vec<AppVersionObject>,
}

impl Family {
    /// Build a family from arbitrary objects, dropping those outside it
    pub fn new(name: impl Into<String>, objects: Vec<AppVersionObject>) -> Self {
        let name = name.into();
        let mut members: Vec<AppVersionObject> = objects
            .into_iter()
            .filter(|o| parse_ordinal(&name, &o.display_name).is_some())
            .collect();
        members.sort_by(newest_first);
        Self { name, members }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Members, newest first
    pub fn members(&self) -> &[AppVersionObject] {
        &self.members
    }

    pub fn current(&self) -> Option<&AppVersionObject> {
        self.members.first()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn find(&self, id: &AppId) -> Option<&AppVersionObject> {
        self.members.iter().find(|m| m.id == *id)
    }

    /// Members whose stored name carries no ordinal suffix
    pub fn unsuffixed(&self) -> impl Iterator<Item = &AppVersionObject> {
        self.members
            .iter()
            .filter(|m| parse_ordinal(&self.name, &m.display_name) == Some(0))
    }

    /// Members whose stored name carries an ordinal suffix
    pub fn suffixed(&self) -> impl Iterator<Item = &AppVersionObject> {
        self.members
            .iter()
            .filter(|m| parse_ordinal(&self.name, &m.display_name).is_some_and(|k| k > 0))
    }

    /// Copy of the family without the member `id`
    pub fn without(&self, id: &AppId) -> Family {
        Family {
            name: self.name.clone(),
            members: self.members.iter().filter(|m| m.id != *id).cloned().collect(),
        }
    }

    /// Whether stored names already follow the ordinal sequence
    pub fn is_compact(&self) -> bool {
        self.members
            .iter()
            .enumerate()
            .all(|(i, m)| m.display_name == ordinal_name(&self.name, i))
    }
}

/// Reads families from the directory
pub struct FamilyResolver<'a> {
    directory: &'a dyn DirectoryService,
    policy: RetryPolicy,
}

impl<'a> FamilyResolver<'a> {
    pub fn new(directory: &'a dyn DirectoryService, policy: RetryPolicy) -> Self {
        Self { directory, policy }
    }

    /// Query and sort the family of `name`
    ///
    /// Exhausted retries surface as [`Error::FamilyUnavailable`]: without an
    /// accurate family view no publish decision is safe.
    pub fn resolve(&self, name: &str) -> Result<Family> {
        let objects = self
            .policy
            .run("family query", || self.directory.find_by_display_name(name))
            .map_err(|e| match e {
                Error::RetriesExhausted {
                    attempts, message, ..
                } => Error::FamilyUnavailable {
                    name: name.to_string(),
                    attempts,
                    message,
                },
                other => Error::FamilyUnavailable {
                    name: name.to_string(),
                    attempts: 1,
                    message: other.to_string(),
                },
            })?;

        let family = Family::new(name, objects);
        debug!("Resolved family {} with {} members", name, family.len());
        if let Some(current) = family.current() {
            info!("Current {} is {} ({})", name, current.version, current.id);
        }
        Ok(family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryOp, MemoryDirectory};
    use chrono::{Duration, TimeZone, Utc};

    fn obj(id: &str, name: &str, version: &str, minute: i64) -> AppVersionObject {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        AppVersionObject::new(id, name, version, base + Duration::minutes(minute))
    }

    #[test]
    fn test_ordinal_names() {
        assert_eq!(ordinal_name("Tool", 0), "Tool");
        assert_eq!(ordinal_name("Tool", 3), "Tool (N-3)");
        assert_eq!(parse_ordinal("Tool", "Tool"), Some(0));
        assert_eq!(parse_ordinal("Tool", "Tool (N-12)"), Some(12));
        assert_eq!(parse_ordinal("Tool", "Tool (N-)"), None);
        assert_eq!(parse_ordinal("Tool", "Tool (N-0)"), None);
        assert_eq!(parse_ordinal("Tool", "Tool (N-1a)"), None);
        assert_eq!(parse_ordinal("Tool", "Toolbox"), None);
        assert_eq!(parse_ordinal("Tool", "Tool (N-1) copy"), None);
        assert_eq!(parse_ordinal("Tool", "Tool (old)"), None);
    }

    #[test]
    fn test_family_sort_and_tie_break() {
        let family = Family::new(
            "Tool",
            vec![
                obj("old", "Tool (N-1)", "1.0", 0),
                obj("dup-early", "Tool", "2.0", 5),
                obj("dup-late", "Tool", "2.00", 9),
                obj("other", "Toolbox", "9.0", 1),
            ],
        );
        let ids: Vec<&str> = family.members().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["dup-late", "dup-early", "old"]);
        assert_eq!(family.unsuffixed().count(), 2);
        assert_eq!(family.suffixed().count(), 1);
        assert!(!family.is_compact());
    }

    #[test]
    fn test_resolve_retries_transient_failures() {
        let dir = MemoryDirectory::new();
        dir.insert(obj("a", "Tool", "2.0", 1));
        dir.insert(obj("b", "Tool (N-1)", "1.0", 0));
        dir.fail_next(DirectoryOp::Find, 2);

        let family = FamilyResolver::new(&dir, RetryPolicy::immediate(3))
            .resolve("Tool")
            .unwrap();
        assert_eq!(family.len(), 2);
        assert!(family.is_compact());
        assert_eq!(family.current().unwrap().id.as_str(), "a");
    }

    #[test]
    fn test_resolve_exhaustion_is_fatal() {
        let dir = MemoryDirectory::new();
        dir.insert(obj("a", "Tool", "2.0", 1));
        dir.fail_next(DirectoryOp::Find, 3);

        let err = FamilyResolver::new(&dir, RetryPolicy::immediate(3))
            .resolve("Tool")
            .unwrap_err();
        assert!(matches!(err, Error::FamilyUnavailable { attempts: 3, .. }));
    }
}
