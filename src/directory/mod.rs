// src/directory/mod.rs

//! Directory service contract
//!
//! The directory is the system of record for application version objects,
//! their group assignments and the dependency links between them. The
//! engine only relies on the small operation set in [`DirectoryService`]:
//!
//! - Reads may lag writes; callers confirm mutations by re-reading
//! - Adding a duplicate assignment may silently do nothing
//! - Removing an absent assignment is not an error
//! - Dependency lists are replaced whole on the owning (source) side
//!
//! Two implementations ship with the crate: [`GraphDirectory`] talks to a
//! Graph-style REST endpoint, [`MemoryDirectory`] keeps everything in
//! process and can simulate lag and transient faults.

pub mod detection;
pub mod graph;
pub mod memory;
pub mod token;
mod types;

pub use detection::{Comparison, DetectionRule, FileCheck, Operator, RegistryCheck};
pub use graph::GraphDirectory;
pub use memory::{DirectoryOp, MemoryDirectory};
pub use token::{AccessToken, ClientCredentials, TokenCache};
pub use types::{
    AppId, AppVersionObject, Assignment, AssignmentFilter, DependencyLink, DependencyType,
    FilterMode, Intent, Notification, TimeWindow,
};

use crate::error::Result;

/// Operations the rotation engine requires from a directory
///
/// Implementations block the calling thread for the duration of a request.
pub trait DirectoryService: Send + Sync {
    /// Objects named exactly `name` or `"<name> (N-k)"`
    fn find_by_display_name(&self, name: &str) -> Result<Vec<AppVersionObject>>;

    fn get_assignments(&self, app: &AppId) -> Result<Vec<Assignment>>;

    fn add_assignment(&self, app: &AppId, assignment: &Assignment) -> Result<()>;

    /// Remove every assignment of `app` targeting `group_id`
    fn remove_assignment(&self, app: &AppId, group_id: &str) -> Result<()>;

    /// Links where `app` is either the source or the target
    fn get_dependencies(&self, app: &AppId) -> Result<Vec<DependencyLink>>;

    /// Replace every link whose source is `owner`
    fn replace_dependency_list(&self, owner: &AppId, links: &[DependencyLink]) -> Result<()>;

    fn rename(&self, app: &AppId, display_name: &str) -> Result<()>;

    fn delete(&self, app: &AppId) -> Result<()>;
}
