// src/directory/memory.rs

//! In-process directory
//!
//! Keeps application objects, assignments and dependency links in memory
//! and reproduces the directory behaviours the engine has to cope with:
//!
//! - Read lag: a write only becomes visible after a number of reads
//! - Transient failures, injected per operation
//! - Adds that are accepted but never stick
//!
//! Every call is logged so callers can count mutations.

use super::{AppId, AppVersionObject, Assignment, DependencyLink, DirectoryService};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::trace;

/// Directory operation kinds, for fault injection and the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectoryOp {
    Find,
    GetAssignments,
    AddAssignment,
    RemoveAssignment,
    GetDependencies,
    ReplaceDependencies,
    Rename,
    Delete,
}

impl DirectoryOp {
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            DirectoryOp::Find | DirectoryOp::GetAssignments | DirectoryOp::GetDependencies
        )
    }
}

#[derive(Debug, Clone)]
struct Lagged<T> {
    value: T,
    /// Reads remaining before the value becomes visible
    hidden_reads: u32,
}

impl<T> Lagged<T> {
    fn visible(&self) -> bool {
        self.hidden_reads == 0
    }

    fn age(&mut self) {
        self.hidden_reads = self.hidden_reads.saturating_sub(1);
    }
}

#[derive(Debug, Default)]
struct State {
    apps: BTreeMap<AppId, AppVersionObject>,
    assignments: HashMap<AppId, Vec<Lagged<Assignment>>>,
    links: Vec<Lagged<DependencyLink>>,
    failures: HashMap<DirectoryOp, u32>,
    ignored_groups: HashSet<String>,
    log: Vec<(DirectoryOp, String)>,
    next_assignment: u64,
}

impl State {
    fn enter(&mut self, op: DirectoryOp, subject: &str) -> Result<()> {
        self.log.push((op, subject.to_string()));
        if let Some(remaining) = self.failures.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::DirectoryError(format!(
                "injected {:?} failure for {}",
                op, subject
            )));
        }
        Ok(())
    }

    fn require(&self, app: &AppId) -> Result<()> {
        if self.apps.contains_key(app) {
            Ok(())
        } else {
            Err(Error::NotFound(app.to_string()))
        }
    }

    fn snapshot(&self, app: &AppVersionObject) -> AppVersionObject {
        let mut object = app.clone();
        object.assignments = self
            .assignments
            .get(&app.id)
            .map(|list| {
                list.iter()
                    .filter(|a| a.visible())
                    .map(|a| a.value.clone())
                    .collect()
            })
            .unwrap_or_default();
        object.dependencies = self
            .links
            .iter()
            .filter(|l| l.visible() && l.value.source_id == app.id)
            .map(|l| l.value.clone())
            .collect();
        object
    }
}

/// Directory held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    state: Mutex<State>,
    read_lag: u32,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory whose writes stay invisible for `reads` subsequent reads
    pub fn with_read_lag(reads: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            read_lag: reads,
        }
    }

    /// Store an object together with its assignments and outbound links
    pub fn insert(&self, object: AppVersionObject) {
        let mut state = self.state.lock();
        let mut stored = object;
        let assignments = std::mem::take(&mut stored.assignments);
        let links = std::mem::take(&mut stored.dependencies);

        let mut list = Vec::with_capacity(assignments.len());
        for mut assignment in assignments {
            if assignment.id.is_none() {
                state.next_assignment += 1;
                assignment.id = Some(format!("asg-{}", state.next_assignment));
            }
            list.push(Lagged {
                value: assignment,
                hidden_reads: 0,
            });
        }
        state.assignments.insert(stored.id.clone(), list);
        state.links.retain(|l| l.value.source_id != stored.id);
        state.links.extend(links.into_iter().map(|mut link| {
            link.source_id = stored.id.clone();
            Lagged {
                value: link,
                hidden_reads: 0,
            }
        }));
        state.apps.insert(stored.id.clone(), stored);
    }

    /// Current snapshot of one object, including writes still lagging
    pub fn app(&self, id: &AppId) -> Option<AppVersionObject> {
        let state = self.state.lock();
        let app = state.apps.get(id)?;
        let mut object = app.clone();
        object.assignments = state
            .assignments
            .get(id)
            .map(|list| list.iter().map(|a| a.value.clone()).collect())
            .unwrap_or_default();
        object.dependencies = state
            .links
            .iter()
            .filter(|l| l.value.source_id == *id)
            .map(|l| l.value.clone())
            .collect();
        Some(object)
    }

    pub fn app_ids(&self) -> Vec<AppId> {
        self.state.lock().apps.keys().cloned().collect()
    }

    /// Fail the next `times` calls of `op` with a transient error
    pub fn fail_next(&self, op: DirectoryOp, times: u32) {
        self.state.lock().failures.insert(op, times);
    }

    /// Accept adds targeting `group_id` without ever storing them
    pub fn ignore_adds_for(&self, group_id: &str) {
        self.state.lock().ignored_groups.insert(group_id.to_string());
    }

    pub fn mutation_count(&self) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(op, _)| op.is_mutation())
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().log.clear();
    }
}

impl DirectoryService for MemoryDirectory {
    fn find_by_display_name(&self, name: &str) -> Result<Vec<AppVersionObject>> {
        let mut state = self.state.lock();
        state.enter(DirectoryOp::Find, name)?;

        let prefix = format!("{} (N-", name);
        let found = state
            .apps
            .values()
            .filter(|app| {
                app.display_name == name
                    || (app.display_name.starts_with(&prefix) && app.display_name.ends_with(')'))
            })
            .map(|app| state.snapshot(app))
            .collect();
        Ok(found)
    }

    fn get_assignments(&self, app: &AppId) -> Result<Vec<Assignment>> {
        let mut state = self.state.lock();
        state.enter(DirectoryOp::GetAssignments, app.as_str())?;
        state.require(app)?;

        let list = state.assignments.entry(app.clone()).or_default();
        let visible = list
            .iter()
            .filter(|a| a.visible())
            .map(|a| a.value.clone())
            .collect();
        list.iter_mut().for_each(Lagged::age);
        Ok(visible)
    }

    fn add_assignment(&self, app: &AppId, assignment: &Assignment) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(DirectoryOp::AddAssignment, app.as_str())?;
        state.require(app)?;

        if state.ignored_groups.contains(&assignment.target_group_id) {
            trace!("dropping add of {} on {}", assignment.target_group_id, app);
            return Ok(());
        }

        state.next_assignment += 1;
        let id = format!("asg-{}", state.next_assignment);
        let lag = self.read_lag;
        let list = state.assignments.entry(app.clone()).or_default();
        if list
            .iter()
            .any(|a| a.value.target_group_id == assignment.target_group_id)
        {
            // Duplicate group: accepted and ignored
            return Ok(());
        }

        let mut stored = assignment.clone();
        stored.id = Some(id);
        list.push(Lagged {
            value: stored,
            hidden_reads: lag,
        });
        Ok(())
    }

    fn remove_assignment(&self, app: &AppId, group_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(DirectoryOp::RemoveAssignment, app.as_str())?;
        state.require(app)?;

        if let Some(list) = state.assignments.get_mut(app) {
            list.retain(|a| a.value.target_group_id != group_id);
        }
        Ok(())
    }

    fn get_dependencies(&self, app: &AppId) -> Result<Vec<DependencyLink>> {
        let mut state = self.state.lock();
        state.enter(DirectoryOp::GetDependencies, app.as_str())?;
        state.require(app)?;

        let mut visible = Vec::new();
        for link in state
            .links
            .iter_mut()
            .filter(|l| l.value.source_id == *app || l.value.target_id == *app)
        {
            if link.visible() {
                visible.push(link.value.clone());
            }
            link.age();
        }
        Ok(visible)
    }

    fn replace_dependency_list(&self, owner: &AppId, links: &[DependencyLink]) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(DirectoryOp::ReplaceDependencies, owner.as_str())?;
        state.require(owner)?;
        for link in links {
            state.require(&link.target_id)?;
        }

        let lag = self.read_lag;
        state.links.retain(|l| l.value.source_id != *owner);
        state.links.extend(links.iter().map(|link| Lagged {
            value: DependencyLink {
                source_id: owner.clone(),
                ..link.clone()
            },
            hidden_reads: lag,
        }));
        Ok(())
    }

    fn rename(&self, app: &AppId, display_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(DirectoryOp::Rename, app.as_str())?;
        match state.apps.get_mut(app) {
            Some(object) => {
                object.display_name = display_name.to_string();
                Ok(())
            }
            None => Err(Error::NotFound(app.to_string())),
        }
    }

    fn delete(&self, app: &AppId) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(DirectoryOp::Delete, app.as_str())?;
        state.require(app)?;

        if let Some(dependent) = state
            .links
            .iter()
            .find(|l| l.value.target_id == *app && l.value.source_id != *app)
        {
            return Err(Error::DirectoryError(format!(
                "{} is still required by {}",
                app, dependent.value.source_id
            )));
        }

        state.apps.remove(app);
        state.assignments.remove(app);
        state.links.retain(|l| l.value.source_id != *app);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DependencyType, Intent};
    use chrono::{TimeZone, Utc};

    fn app(id: &str, name: &str, version: &str) -> AppVersionObject {
        AppVersionObject::new(id, name, version, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_find_matches_exact_and_ordinal_only() {
        let dir = MemoryDirectory::new();
        dir.insert(app("a", "Tool", "2.0"));
        dir.insert(app("b", "Tool (N-1)", "1.0"));
        dir.insert(app("c", "Toolbox", "9.0"));
        dir.insert(app("d", "Tool Pro", "3.0"));

        let mut ids: Vec<String> = dir
            .find_by_display_name("Tool")
            .unwrap()
            .into_iter()
            .map(|a| a.id.0)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_read_lag_hides_new_assignments() {
        let dir = MemoryDirectory::with_read_lag(2);
        dir.insert(app("a", "Tool", "1.0"));
        let id = AppId::from("a");

        dir.add_assignment(&id, &Assignment::new("grp", Intent::Required)).unwrap();
        assert!(dir.get_assignments(&id).unwrap().is_empty());
        assert!(dir.get_assignments(&id).unwrap().is_empty());
        assert_eq!(dir.get_assignments(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_injected_failures_are_transient() {
        let dir = MemoryDirectory::new();
        dir.insert(app("a", "Tool", "1.0"));
        dir.fail_next(DirectoryOp::GetAssignments, 1);

        let err = dir.get_assignments(&AppId::from("a")).unwrap_err();
        assert!(err.is_transient());
        assert!(dir.get_assignments(&AppId::from("a")).is_ok());
    }

    #[test]
    fn test_ignored_adds_never_appear() {
        let dir = MemoryDirectory::new();
        dir.insert(app("a", "Tool", "1.0"));
        dir.ignore_adds_for("grp");
        let id = AppId::from("a");

        dir.add_assignment(&id, &Assignment::new("grp", Intent::Available)).unwrap();
        assert!(dir.get_assignments(&id).unwrap().is_empty());
        assert_eq!(dir.mutation_count(), 1);
    }

    #[test]
    fn test_delete_refuses_required_apps() {
        let dir = MemoryDirectory::new();
        dir.insert(app("lib", "Runtime", "1.0"));
        let mut consumer = app("app", "Tool", "1.0");
        consumer.dependencies.push(DependencyLink::new(
            &AppId::from("app"),
            &AppId::from("lib"),
            DependencyType::AutoInstall,
        ));
        dir.insert(consumer);

        assert!(dir.delete(&AppId::from("lib")).is_err());
        dir.delete(&AppId::from("app")).unwrap();
        dir.delete(&AppId::from("lib")).unwrap();
        assert!(dir.app_ids().is_empty());
    }

    #[test]
    fn test_replace_dependency_list_is_whole_list() {
        let dir = MemoryDirectory::new();
        for id in ["app", "x", "y", "z"] {
            dir.insert(app(id, id, "1.0"));
        }
        let owner = AppId::from("app");
        let link = |t: &str| DependencyLink::new(&owner, &AppId::from(t), DependencyType::Detect);

        dir.replace_dependency_list(&owner, &[link("x"), link("y")]).unwrap();
        dir.replace_dependency_list(&owner, &[link("z")]).unwrap();

        let deps = dir.get_dependencies(&owner).unwrap();
        assert_eq!(deps, vec![link("z")]);
    }
}
