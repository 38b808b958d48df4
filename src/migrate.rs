// src/migrate.rs

//! Moving deployments between version objects
//!
//! A migration moves everything that makes an object "live" onto another
//! object of the same family:
//!
//! - Group assignments are re-created on the target, confirmed by reading
//!   them back, and only then removed from the source
//! - Applications depending on the source are re-pointed at the target by
//!   rebuilding their whole dependency list
//! - The source's own dependencies are carried over when the target
//!   declares none
//!
//! Nothing is ever removed from the source unless its replacement was
//! confirmed. A failed step leaves residue (a duplicate assignment, an old
//! dependency edge) and protects the source from deletion.

use crate::directory::{
    AppId, Assignment, DependencyLink, DependencyType, DirectoryService, TimeWindow,
};
use crate::error::Result;
use crate::retry::RetryPolicies;
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Objects that must survive pruning because something still needs them
pub type ProtectedIds = BTreeSet<AppId>;

/// Day offsets applied to re-created assignment windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateOffsets {
    /// Days from today for the availability instant
    #[serde(default)]
    pub available_days: i64,
    /// Days from today for the installation deadline
    #[serde(default)]
    pub deadline_days: i64,
}

impl DateOffsets {
    pub fn new(available_days: i64, deadline_days: i64) -> Self {
        Self {
            available_days,
            deadline_days,
        }
    }

    /// Move each present instant to today + offset, keeping its time of day
    ///
    /// `local_today` is used for windows evaluated in device-local time,
    /// `utc_today` for the rest.
    pub fn shift(&self, window: TimeWindow, utc_today: NaiveDate, local_today: NaiveDate) -> TimeWindow {
        let today = if window.use_local_time {
            local_today
        } else {
            utc_today
        };
        let move_to = |instant: NaiveDateTime, days: i64| {
            let date = today
                .checked_add_signed(Duration::days(days))
                .unwrap_or(today);
            date.and_time(instant.time())
        };

        TimeWindow {
            available_at: window.available_at.map(|t| move_to(t, self.available_days)),
            deadline_at: window.deadline_at.map(|t| move_to(t, self.deadline_days)),
            use_local_time: window.use_local_time,
        }
    }
}

/// What one migration achieved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub from: AppId,
    pub to: AppId,
    pub assignments_moved: usize,
    /// Assignments that could not be confirmed on the target
    pub assignments_left: usize,
    /// Moved assignments whose original could not be removed
    pub residual_duplicates: usize,
    pub dependencies_moved: usize,
    /// Dependent edges still pointing at the source
    pub dependencies_left: usize,
    /// Source-owned edges copied onto the target
    pub dependencies_carried: usize,
    pub errors: Vec<String>,
}

impl MigrationResult {
    fn new(from: &AppId, to: &AppId) -> Self {
        Self {
            from: from.clone(),
            to: to.clone(),
            assignments_moved: 0,
            assignments_left: 0,
            residual_duplicates: 0,
            dependencies_moved: 0,
            dependencies_left: 0,
            dependencies_carried: 0,
            errors: Vec::new(),
        }
    }

    /// Everything moved, nothing left behind, no errors
    pub fn is_clean(&self) -> bool {
        self.assignments_left == 0
            && self.residual_duplicates == 0
            && self.dependencies_left == 0
            && self.errors.is_empty()
    }

    /// Whether the source still holds something that was not moved
    pub fn left_residue(&self) -> bool {
        self.assignments_left > 0 || self.dependencies_left > 0
    }

    pub fn is_noop(&self) -> bool {
        self.assignments_moved == 0
            && self.dependencies_moved == 0
            && self.dependencies_carried == 0
            && !self.left_residue()
    }
}

/// Drives migrations against a directory
pub struct Migrator<'a> {
    directory: &'a dyn DirectoryService,
    policies: RetryPolicies,
    offsets: DateOffsets,
    utc_today: NaiveDate,
    local_today: NaiveDate,
}

impl<'a> Migrator<'a> {
    pub fn new(directory: &'a dyn DirectoryService, policies: RetryPolicies, offsets: DateOffsets) -> Self {
        Self {
            directory,
            policies,
            offsets,
            utc_today: Utc::now().date_naive(),
            local_today: Local::now().date_naive(),
        }
    }

    /// Pin the date windows are shifted from
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.utc_today = today;
        self.local_today = today;
        self
    }

    /// Move assignments and dependency links from `from` onto `to`
    ///
    /// `protected` collects objects that must not be pruned afterwards:
    /// `to` once a dependent has been re-pointed at it, `from` whenever
    /// something could not be moved off it.
    pub fn migrate(&self, from: &AppId, to: &AppId, protected: &mut ProtectedIds) -> MigrationResult {
        let mut result = MigrationResult::new(from, to);
        if from == to {
            return result;
        }
        info!("Migrating {} -> {}", from, to);

        self.migrate_assignments(&mut result, protected);
        self.migrate_dependencies(&mut result, protected);

        if result.left_residue() {
            protected.insert(from.clone());
        }

        if result.is_clean() {
            debug!(
                "Migration {} -> {} clean: {} assignments, {} dependencies",
                from, to, result.assignments_moved, result.dependencies_moved
            );
        } else {
            warn!(
                "Migration {} -> {} incomplete: {} assignments left, {} dependencies left, {} errors",
                from,
                to,
                result.assignments_left,
                result.dependencies_left,
                result.errors.len()
            );
        }
        result
    }

    /// Add `assignment` to `app` and confirm it by reading it back
    pub fn add_verified(&self, app: &AppId, assignment: &Assignment) -> Result<bool> {
        let group = assignment.target_group_id.as_str();
        let intent = assignment.intent;
        self.policies.write.execute(
            &format!("{} assignment of {} to {}", intent, app, group),
            || self.directory.add_assignment(app, assignment),
            || {
                Ok(self
                    .directory
                    .get_assignments(app)?
                    .iter()
                    .any(|a| a.targets(group, intent)))
            },
        )
    }

    fn migrate_assignments(&self, result: &mut MigrationResult, protected: &mut ProtectedIds) {
        let from = result.from.clone();
        let to = result.to.clone();

        let assignments = match self
            .policies
            .query
            .run("assignment listing", || self.directory.get_assignments(&from))
        {
            Ok(list) => list,
            Err(e) => {
                result.errors.push(format!("Could not list assignments of {from}: {e}"));
                protected.insert(from.clone());
                return;
            }
        };
        if assignments.is_empty() {
            return;
        }

        // Already present on the target (earlier partial run, default deployment)
        let existing = self
            .policies
            .query
            .run("assignment listing", || self.directory.get_assignments(&to))
            .unwrap_or_default();

        for assignment in assignments {
            let group = assignment.target_group_id.clone();
            let present = existing.iter().any(|a| a.targets(&group, assignment.intent));

            let confirmed = if present {
                debug!("{} already assigned to {} on {}", assignment.intent, group, to);
                true
            } else {
                let mut copy = assignment.clone();
                copy.id = None;
                copy.window = copy
                    .window
                    .map(|w| self.offsets.shift(w, self.utc_today, self.local_today));
                match self.add_verified(&to, &copy) {
                    Ok(confirmed) => confirmed,
                    Err(e) => {
                        result.errors.push(format!("Adding {group} to {to} failed: {e}"));
                        false
                    }
                }
            };

            if !confirmed {
                warn!(
                    "Assignment of {} to {} could not be confirmed on {}; keeping it on {}",
                    assignment.intent, group, to, from
                );
                result.assignments_left += 1;
                continue;
            }

            result.assignments_moved += 1;
            if let Err(e) = self
                .policies
                .remove
                .run("assignment removal", || self.directory.remove_assignment(&from, &group))
            {
                warn!("Could not remove {} from {}: {}", group, from, e);
                result.residual_duplicates += 1;
                result.errors.push(format!("Removing {group} from {from} failed: {e}"));
            }
        }
    }

    fn migrate_dependencies(&self, result: &mut MigrationResult, protected: &mut ProtectedIds) {
        let from = result.from.clone();
        let to = result.to.clone();

        let links = match self
            .policies
            .query
            .run("dependency listing", || self.directory.get_dependencies(&from))
        {
            Ok(links) => links,
            Err(e) => {
                result.errors.push(format!("Could not list dependencies of {from}: {e}"));
                protected.insert(from.clone());
                return;
            }
        };

        let inbound: Vec<&DependencyLink> = links
            .iter()
            .filter(|l| l.target_id == from && l.source_id != from)
            .collect();
        let outbound: Vec<&DependencyLink> =
            links.iter().filter(|l| l.source_id == from).collect();

        let mut dependents: Vec<&AppId> = inbound.iter().map(|l| &l.source_id).collect();
        dependents.sort();
        dependents.dedup();

        for dependent in dependents {
            let edges: Vec<&DependencyLink> = inbound
                .iter()
                .copied()
                .filter(|l| l.source_id == *dependent)
                .collect();

            if *dependent == to {
                warn!("{} depends on {}; not re-pointing it onto itself", to, from);
                result.dependencies_left += edges.len();
                continue;
            }

            let dependency_type = edges
                .iter()
                .map(|l| l.dependency_type)
                .max_by_key(|t| *t == DependencyType::AutoInstall)
                .unwrap_or_default();

            match self.repoint(dependent, &from, &to, dependency_type) {
                Ok(true) => {
                    info!("Re-pointed {} from {} to {}", dependent, from, to);
                    result.dependencies_moved += edges.len();
                    protected.insert(to.clone());
                }
                Ok(false) => {
                    warn!("Re-pointing {} onto {} was not confirmed", dependent, to);
                    result.dependencies_left += edges.len();
                }
                Err(e) => {
                    result.dependencies_left += edges.len();
                    result
                        .errors
                        .push(format!("Re-pointing {dependent} onto {to} failed: {e}"));
                }
            }
        }

        if result.dependencies_left > 0 {
            protected.insert(from.clone());
        }

        if !outbound.is_empty() {
            self.carry_outbound(result, &outbound);
        }
    }

    /// Rebuild `dependent`'s dependency list with `from` replaced by `to`
    ///
    /// The list is replaced whole, so every sibling entry is re-sent as is.
    fn repoint(
        &self,
        dependent: &AppId,
        from: &AppId,
        to: &AppId,
        dependency_type: DependencyType,
    ) -> Result<bool> {
        let current = self
            .policies
            .query
            .run("dependency listing", || self.directory.get_dependencies(dependent))?;

        let mut rebuilt: Vec<DependencyLink> = Vec::new();
        for link in current.into_iter().filter(|l| l.source_id == *dependent) {
            let link = if link.target_id == *from {
                DependencyLink {
                    target_id: to.clone(),
                    ..link
                }
            } else {
                link
            };
            match rebuilt.iter_mut().find(|l| l.target_id == link.target_id) {
                Some(existing) => {
                    if link.dependency_type == DependencyType::AutoInstall {
                        existing.dependency_type = DependencyType::AutoInstall;
                    }
                }
                None => rebuilt.push(link),
            }
        }
        // The dependent's own listing may lag behind what `from` reported
        if !rebuilt.iter().any(|l| l.target_id == *to) {
            rebuilt.push(DependencyLink::new(dependent, to, dependency_type));
        }

        self.policies.write.execute(
            &format!("dependency of {} on {}", dependent, to),
            || self.directory.replace_dependency_list(dependent, &rebuilt),
            || {
                Ok(self
                    .directory
                    .get_dependencies(to)?
                    .iter()
                    .any(|l| l.source_id == *dependent && l.target_id == *to))
            },
        )
    }

    /// Copy `from`'s own dependencies onto `to` when `to` declares none
    fn carry_outbound(&self, result: &mut MigrationResult, outbound: &[&DependencyLink]) {
        let to = result.to.clone();

        let existing = match self
            .policies
            .query
            .run("dependency listing", || self.directory.get_dependencies(&to))
        {
            Ok(links) => links,
            Err(e) => {
                result.errors.push(format!("Could not list dependencies of {to}: {e}"));
                return;
            }
        };
        if existing.iter().any(|l| l.source_id == to) {
            return;
        }

        let carried: Vec<DependencyLink> = outbound
            .iter()
            .filter(|l| l.target_id != to)
            .map(|l| DependencyLink::new(&to, &l.target_id, l.dependency_type))
            .collect();
        if carried.is_empty() {
            return;
        }

        let confirmed = self.policies.write.execute(
            &format!("dependency list of {}", to),
            || self.directory.replace_dependency_list(&to, &carried),
            || {
                let now = self.directory.get_dependencies(&to)?;
                Ok(carried
                    .iter()
                    .all(|c| now.iter().any(|l| l.source_id == to && l.target_id == c.target_id)))
            },
        );
        match confirmed {
            Ok(true) => result.dependencies_carried += carried.len(),
            Ok(false) => result
                .errors
                .push(format!("Dependencies carried onto {to} were not confirmed")),
            Err(e) => result
                .errors
                .push(format!("Carrying dependencies onto {to} failed: {e}")),
        }
    }
}
