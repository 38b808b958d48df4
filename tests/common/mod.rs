// tests/common/mod.rs

//! Shared fixtures for publish and migration tests.

use apprelay::directory::{DependencyType, Intent};
use apprelay::{
    AppId, AppVersionObject, Assignment, DependencyLink, FamilyResolver, MemoryDirectory,
    RetryPolicies, RetryPolicy, RotationController,
};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

/// Date assignment windows are shifted from in every test
pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
}

/// Creation time `minute` minutes after a fixed epoch
pub fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
}

pub fn version_object(id: &str, name: &str, version: &str, minute: i64) -> AppVersionObject {
    AppVersionObject::new(id, name, version, at(minute))
}

/// Object deployed to `groups` as required
pub fn deployed(id: &str, name: &str, version: &str, minute: i64, groups: &[&str]) -> AppVersionObject {
    let mut object = version_object(id, name, version, minute);
    object.assignments = groups
        .iter()
        .map(|g| Assignment::new(*g, Intent::Required))
        .collect();
    object
}

/// Object `source` that requires each of `targets`
pub fn dependent(source: &str, name: &str, targets: &[&str]) -> AppVersionObject {
    let mut object = version_object(source, name, "1.0", 0);
    let id = AppId::from(source);
    object.dependencies = targets
        .iter()
        .map(|t| DependencyLink::new(&id, &AppId::from(*t), DependencyType::AutoInstall))
        .collect();
    object
}

/// The usual starting point: v1 current on "pilot", v0 as N-1 on "legacy",
/// and a freshly registered v2 awaiting publish
pub fn seeded_directory() -> MemoryDirectory {
    let dir = MemoryDirectory::new();
    seed(&dir);
    dir
}

pub fn seed(dir: &MemoryDirectory) {
    dir.insert(deployed("v0", "Tool (N-1)", "1.0", 0, &["legacy"]));
    dir.insert(deployed("v1", "Tool", "1.5", 10, &["pilot"]));
    dir.insert(version_object("v2", "Tool", "2.0", 20));
}

pub fn controller(dir: &MemoryDirectory) -> RotationController<'_> {
    RotationController::new(dir, RetryPolicies::immediate(3)).with_today(today())
}

/// `(id, display name)` of every family member, newest first
pub fn names(dir: &MemoryDirectory, name: &str) -> Vec<(String, String)> {
    FamilyResolver::new(dir, RetryPolicy::immediate(1))
        .resolve(name)
        .unwrap()
        .members()
        .iter()
        .map(|m| (m.id.to_string(), m.display_name.clone()))
        .collect()
}

/// Assignment groups currently stored on `id`
pub fn groups(dir: &MemoryDirectory, id: &str) -> Vec<String> {
    let mut groups: Vec<String> = dir
        .app(&AppId::from(id))
        .unwrap()
        .assignments
        .into_iter()
        .map(|a| a.target_group_id)
        .collect();
    groups.sort();
    groups
}

/// Targets `id` currently requires
pub fn requires(dir: &MemoryDirectory, id: &str) -> Vec<String> {
    let mut targets: Vec<String> = dir
        .app(&AppId::from(id))
        .unwrap()
        .dependencies
        .into_iter()
        .map(|l| l.target_id.to_string())
        .collect();
    targets.sort();
    targets
}

pub fn pair(id: &str, display: &str) -> (String, String) {
    (id.to_string(), display.to_string())
}
