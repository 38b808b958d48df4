// src/directory/types.rs

//! Application, assignment and dependency records held by the directory

use super::detection::DetectionRule;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, directory-assigned identifier of an application version object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One published version of one logical application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppVersionObject {
    pub id: AppId,
    /// Logical name, possibly carrying an ordinal suffix like " (N-2)"
    pub display_name: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    #[serde(default)]
    pub dependencies: Vec<DependencyLink>,
    #[serde(default)]
    pub detection_rules: Vec<DetectionRule>,
}

impl AppVersionObject {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        version: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AppId::new(id),
            display_name: display_name.into(),
            version: version.into(),
            created_at,
            assignments: Vec::new(),
            dependencies: Vec::new(),
            detection_rules: Vec::new(),
        }
    }

    pub fn version_key(&self) -> crate::version::VersionKey {
        crate::version::VersionKey::parse(&self.version)
    }
}

/// Deployment intent of an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Intent {
    Available,
    Required,
    Uninstall,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Available => write!(f, "available"),
            Intent::Required => write!(f, "required"),
            Intent::Uninstall => write!(f, "uninstall"),
        }
    }
}

/// End-user notification setting of an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Notification {
    #[default]
    ShowAll,
    ShowReboot,
    HideAll,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::ShowAll => write!(f, "showAll"),
            Notification::ShowReboot => write!(f, "showReboot"),
            Notification::HideAll => write!(f, "hideAll"),
        }
    }
}

/// Availability and installation deadline of an assignment
///
/// Instants are wall-clock values; `use_local_time` tells the device whether
/// to read them in its own time zone or as UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeWindow {
    pub available_at: Option<NaiveDateTime>,
    pub deadline_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub use_local_time: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterMode {
    Include,
    Exclude,
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterMode::Include => write!(f, "include"),
            FilterMode::Exclude => write!(f, "exclude"),
        }
    }
}

/// Device filter narrowing an assignment's target group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentFilter {
    pub mode: FilterMode,
    pub filter_id: String,
}

/// Deployment of an application to a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Directory-assigned id, absent on assignments not yet created
    #[serde(default)]
    pub id: Option<String>,
    pub target_group_id: String,
    pub intent: Intent,
    #[serde(default)]
    pub notifications: Notification,
    #[serde(default)]
    pub window: Option<TimeWindow>,
    #[serde(default)]
    pub filter: Option<AssignmentFilter>,
}

impl Assignment {
    pub fn new(target_group_id: impl Into<String>, intent: Intent) -> Self {
        Self {
            id: None,
            target_group_id: target_group_id.into(),
            intent,
            notifications: Notification::default(),
            window: None,
            filter: None,
        }
    }

    /// Whether this assignment deploys to `group_id` with `intent`
    pub fn targets(&self, group_id: &str, intent: Intent) -> bool {
        self.target_group_id == group_id && self.intent == intent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DependencyType {
    #[default]
    Detect,
    AutoInstall,
}

/// Directed edge: `source_id` requires `target_id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyLink {
    pub source_id: AppId,
    pub target_id: AppId,
    #[serde(default)]
    pub dependency_type: DependencyType,
}

impl DependencyLink {
    pub fn new(source: &AppId, target: &AppId, dependency_type: DependencyType) -> Self {
        Self {
            source_id: source.clone(),
            target_id: target.clone(),
            dependency_type,
        }
    }
}
