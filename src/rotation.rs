// src/rotation.rs

//! Publishing a new version into its family
//!
//! [`RotationController::publish`] walks a fixed sequence of steps:
//!
//! 1. Validate the candidate against lock and version policy
//! 2. Fold same-version conflicts into the new object
//! 3. Promote the new object over every unsuffixed prior member
//! 4. Cascade the ordinal slots one step towards current
//! 5. Re-resolve the family and rename it into ordinal order
//! 6. Add the configured default deployments
//! 7. Prune members beyond the retention count
//!
//! Steps never go back. Transient failures leave residue and degrade the
//! outcome; losing the family view during step 5 fails the publish.

use crate::directory::{
    AppId, AppVersionObject, Assignment, AssignmentFilter, DirectoryService, Intent, Notification,
};
use crate::error::{Error, Result};
use crate::family::{Family, FamilyResolver, ordinal_name};
use crate::migrate::{DateOffsets, MigrationResult, Migrator, ProtectedIds};
use crate::retry::RetryPolicies;
use crate::version::{VersionKey, is_locked};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Older versions kept next to current unless configured otherwise
pub const DEFAULT_RETENTION: usize = 2;

/// Reasons a publish is skipped without touching the directory
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Validation {
    #[error("version {version} does not match lock pattern '{pattern}'")]
    Locked { version: String, pattern: String },

    #[error("version {version} is already published")]
    AlreadyCurrent { version: String },

    #[error("version {version} is older than current {current}")]
    Downgrade { version: String, current: String },
}

/// Group every newly published version is deployed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultDeployment {
    pub group_id: String,
    pub intent: Intent,
    #[serde(default)]
    pub notifications: Notification,
}

impl DefaultDeployment {
    pub fn new(group_id: impl Into<String>, intent: Intent) -> Self {
        Self {
            group_id: group_id.into(),
            intent,
            notifications: Notification::default(),
        }
    }
}

/// Per-application publish settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPolicy {
    /// Older versions kept alongside current
    pub retention: usize,
    /// Wildcard pattern a version must match to be published
    pub lock: Option<String>,
    /// Skip validation and recreate existing versions
    pub force: bool,
    pub offsets: DateOffsets,
    pub deployments: Vec<DefaultDeployment>,
    /// Device filter applied to default deployments
    pub architecture_filter: Option<AssignmentFilter>,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            lock: None,
            force: false,
            offsets: DateOffsets::default(),
            deployments: Vec::new(),
            architecture_filter: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum PublishStatus {
    /// Every step completed and was confirmed
    Clean,
    /// Completed with residue left behind; safe to re-run
    Degraded,
    Skipped(Validation),
    Failed(String),
}

impl fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishStatus::Clean => write!(f, "clean"),
            PublishStatus::Degraded => write!(f, "degraded"),
            PublishStatus::Skipped(reason) => write!(f, "skipped ({})", reason),
            PublishStatus::Failed(message) => write!(f, "failed ({})", message),
        }
    }
}

/// A display name change applied during publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rename {
    pub id: AppId,
    pub from: String,
    pub to: String,
}

/// Everything one publish did, for operators and reports
#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub application: String,
    pub version: String,
    pub status: PublishStatus,
    /// The object that became current
    pub promoted: Option<AppId>,
    pub migrated: Vec<MigrationResult>,
    pub renamed: Vec<Rename>,
    pub pruned: Vec<AppId>,
    /// Objects kept despite retention, to be re-evaluated next publish
    pub protected: Vec<AppId>,
    pub errors: Vec<String>,
}

impl PublishOutcome {
    fn new(application: &str, version: &str) -> Self {
        Self {
            application: application.to_string(),
            version: version.to_string(),
            status: PublishStatus::Clean,
            promoted: None,
            migrated: Vec::new(),
            renamed: Vec::new(),
            pruned: Vec::new(),
            protected: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn failed(application: &str, version: &str, err: &Error) -> Self {
        let mut outcome = Self::new(application, version);
        outcome.status = PublishStatus::Failed(err.to_string());
        outcome
    }

    pub fn is_clean(&self) -> bool {
        self.status == PublishStatus::Clean
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, PublishStatus::Failed(_))
    }

    fn settle(&mut self) {
        let residue = !self.errors.is_empty() || self.migrated.iter().any(|m| !m.is_clean());
        self.status = if residue {
            PublishStatus::Degraded
        } else {
            PublishStatus::Clean
        };
    }
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}, {} migrations, {} renamed, {} pruned, {} protected",
            self.application,
            self.version,
            self.status,
            self.migrated.len(),
            self.renamed.len(),
            self.pruned.len(),
            self.protected.len()
        )?;
        for e in &self.errors {
            write!(f, "\n  error: {}", e)?;
        }
        Ok(())
    }
}

/// One entry of a batch publish
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub name: String,
    pub app_id: AppId,
    pub policy: PublishPolicy,
}

/// Decide whether `candidate` may be published into `prior`
///
/// `prior` must not contain the candidate itself. Forced publishes are
/// never skipped.
pub fn check(candidate: &AppVersionObject, prior: &Family, policy: &PublishPolicy) -> Result<Option<Validation>> {
    if policy.force {
        return Ok(None);
    }

    if is_locked(&candidate.version, policy.lock.as_deref())? {
        return Ok(Some(Validation::Locked {
            version: candidate.version.clone(),
            pattern: policy.lock.clone().unwrap_or_default(),
        }));
    }

    let key = candidate.version_key();
    if prior.members().iter().any(|m| m.version_key() == key) {
        return Ok(Some(Validation::AlreadyCurrent {
            version: candidate.version.clone(),
        }));
    }

    if let Some(current) = prior.current()
        && key < current.version_key()
    {
        return Ok(Some(Validation::Downgrade {
            version: candidate.version.clone(),
            current: current.version.clone(),
        }));
    }

    Ok(None)
}

/// Runs publishes against a directory
pub struct RotationController<'a> {
    directory: &'a dyn DirectoryService,
    policies: RetryPolicies,
    today: Option<NaiveDate>,
}

impl<'a> RotationController<'a> {
    pub fn new(directory: &'a dyn DirectoryService, policies: RetryPolicies) -> Self {
        Self {
            directory,
            policies,
            today: None,
        }
    }

    /// Pin the date assignment windows are shifted from
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn migrator(&self, offsets: DateOffsets) -> Migrator<'a> {
        let migrator = Migrator::new(self.directory, self.policies, offsets);
        match self.today {
            Some(today) => migrator.with_today(today),
            None => migrator,
        }
    }

    /// Resolve `name`, find `app_id` in it and publish it
    pub fn publish_app(&self, name: &str, app_id: &AppId, policy: &PublishPolicy) -> PublishOutcome {
        let family = match FamilyResolver::new(self.directory, self.policies.query).resolve(name) {
            Ok(family) => family,
            Err(e) => {
                error!("Cannot publish {}: {}", name, e);
                return PublishOutcome::failed(name, "", &e);
            }
        };
        match family.find(app_id) {
            Some(candidate) => {
                let candidate = candidate.clone();
                self.publish(&candidate, &family, policy)
            }
            None => {
                let e = Error::NotFound(format!("{} in family {}", app_id, name));
                error!("Cannot publish {}: {}", name, e);
                PublishOutcome::failed(name, "", &e)
            }
        }
    }

    /// Publish `candidate` into `family`
    ///
    /// `family` is the snapshot resolved before publishing and may already
    /// contain the candidate.
    pub fn publish(&self, candidate: &AppVersionObject, family: &Family, policy: &PublishPolicy) -> PublishOutcome {
        let mut outcome = PublishOutcome::new(family.name(), &candidate.version);
        let prior = family.without(&candidate.id);

        warn_on_detection_mismatch(candidate);

        match check(candidate, &prior, policy) {
            Ok(None) => {}
            Ok(Some(reason)) => {
                info!("Skipping {} {}: {}", family.name(), candidate.version, reason);
                outcome.status = PublishStatus::Skipped(reason);
                return outcome;
            }
            Err(e) => {
                error!("Cannot validate {} {}: {}", family.name(), candidate.version, e);
                outcome.status = PublishStatus::Failed(e.to_string());
                return outcome;
            }
        }

        info!(
            "Publishing {} {} ({}) over {} prior versions",
            family.name(),
            candidate.version,
            candidate.id,
            prior.len()
        );

        let mut protected = ProtectedIds::new();
        match self.rotate(candidate, &prior, policy, &mut protected, &mut outcome) {
            Ok(()) => outcome.settle(),
            Err(e) => {
                error!("Publish of {} {} failed: {}", family.name(), candidate.version, e);
                outcome.status = PublishStatus::Failed(e.to_string());
            }
        }
        outcome.protected = protected.into_iter().collect();

        info!("{}", outcome);
        outcome
    }

    /// Publish many applications
    ///
    /// Each family is isolated: a failure only affects that family's
    /// outcome. With `parallel`, distinct families run concurrently while
    /// requests naming the same family keep their order. Outcomes come back
    /// in request order.
    pub fn publish_batch(&self, requests: &[PublishRequest], parallel: bool) -> Vec<PublishOutcome> {
        let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
        for (index, request) in requests.iter().enumerate() {
            match groups.iter_mut().find(|(name, _)| *name == request.name) {
                Some((_, indices)) => indices.push(index),
                None => groups.push((request.name.as_str(), vec![index])),
            }
        }

        let run_family = |indices: &Vec<usize>| -> Vec<(usize, PublishOutcome)> {
            indices
                .iter()
                .map(|&i| {
                    let request = &requests[i];
                    (i, self.publish_app(&request.name, &request.app_id, &request.policy))
                })
                .collect()
        };

        let mut results: Vec<(usize, PublishOutcome)> = if parallel {
            groups
                .par_iter()
                .flat_map_iter(|(_, indices)| run_family(indices))
                .collect()
        } else {
            groups
                .iter()
                .flat_map(|(_, indices)| run_family(indices))
                .collect()
        };
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, outcome)| outcome).collect()
    }

    fn rotate(
        &self,
        candidate: &AppVersionObject,
        prior: &Family,
        policy: &PublishPolicy,
        protected: &mut ProtectedIds,
        outcome: &mut PublishOutcome,
    ) -> Result<()> {
        let migrator = self.migrator(policy.offsets);
        let key = candidate.version_key();

        // Same version already present: fold it into the candidate
        let conflicts: Vec<&AppVersionObject> =
            prior.members().iter().filter(|m| m.version_key() == key).collect();
        let mut remaining = prior.clone();
        for conflict in conflicts {
            info!("Replacing existing {} {} ({})", prior.name(), conflict.version, conflict.id);
            remaining = remaining.without(&conflict.id);

            let result = migrator.migrate(&conflict.id, &candidate.id, protected);
            let clean = result.is_clean();
            outcome.migrated.push(result);
            if clean && !protected.contains(&conflict.id) {
                self.remove(&conflict.id, protected, outcome);
            } else {
                warn!("Keeping {}: its migration left residue", conflict.id);
                protected.insert(conflict.id.clone());
            }
        }

        // Every unsuffixed prior member hands its deployments to the candidate.
        // The N-1 target is taken in family order so it is the member the
        // rename step puts at "(N-1)".
        let slot_target = remaining.unsuffixed().next().map(|m| m.id.clone());
        for member in remaining.unsuffixed() {
            debug!("Promoting {} over {} ({})", candidate.id, member.id, member.version);
            outcome
                .migrated
                .push(migrator.migrate(&member.id, &candidate.id, protected));
        }
        outcome.promoted = Some(candidate.id.clone());

        // Each suffixed member moves one slot towards current
        if let Some(target) = slot_target {
            let mut previous = target;
            for member in remaining.suffixed() {
                outcome
                    .migrated
                    .push(migrator.migrate(&member.id, &previous, protected));
                previous = member.id.clone();
            }
        }

        let family = FamilyResolver::new(self.directory, self.policies.query).resolve(prior.name())?;
        if family.current().map(|c| &c.id) != Some(&candidate.id) {
            warn!(
                "{} ({}) does not sort first in {}",
                candidate.id,
                candidate.version,
                family.name()
            );
        }
        self.rename(&family, outcome)?;

        self.deploy_defaults(&migrator, candidate, policy, outcome);

        for member in family.members().iter().skip(policy.retention + 1) {
            if protected.contains(&member.id) {
                info!("Keeping protected {} ({})", member.id, member.version);
                continue;
            }
            self.remove(&member.id, protected, outcome);
        }

        Ok(())
    }

    fn rename(&self, family: &Family, outcome: &mut PublishOutcome) -> Result<()> {
        for (index, member) in family.members().iter().enumerate() {
            let wanted = ordinal_name(family.name(), index);
            if member.display_name == wanted {
                continue;
            }
            self.policies
                .mutate
                .run("rename", || self.directory.rename(&member.id, &wanted))
                .map_err(|e| Error::Fatal(format!("renaming {} to '{}': {}", member.id, wanted, e)))?;
            info!("Renamed {} '{}' -> '{}'", member.id, member.display_name, wanted);
            outcome.renamed.push(Rename {
                id: member.id.clone(),
                from: member.display_name.clone(),
                to: wanted,
            });
        }
        Ok(())
    }

    fn deploy_defaults(
        &self,
        migrator: &Migrator<'_>,
        candidate: &AppVersionObject,
        policy: &PublishPolicy,
        outcome: &mut PublishOutcome,
    ) {
        if policy.deployments.is_empty() {
            return;
        }
        let existing = match self
            .policies
            .query
            .run("assignment listing", || self.directory.get_assignments(&candidate.id))
        {
            Ok(list) => list,
            Err(e) => {
                outcome
                    .errors
                    .push(format!("Could not list assignments of {}: {}", candidate.id, e));
                return;
            }
        };

        for deployment in &policy.deployments {
            if existing.iter().any(|a| a.target_group_id == deployment.group_id) {
                debug!("{} already deployed to {}", candidate.id, deployment.group_id);
                continue;
            }
            let mut assignment = Assignment::new(deployment.group_id.as_str(), deployment.intent);
            assignment.notifications = deployment.notifications;
            assignment.filter = policy.architecture_filter.clone();

            match migrator.add_verified(&candidate.id, &assignment) {
                Ok(true) => info!(
                    "Deployed {} to {} as {}",
                    candidate.id, deployment.group_id, deployment.intent
                ),
                Ok(false) => outcome.errors.push(format!(
                    "Deployment of {} to {} was not confirmed",
                    candidate.id, deployment.group_id
                )),
                Err(e) => outcome.errors.push(format!(
                    "Deployment of {} to {} failed: {}",
                    candidate.id, deployment.group_id, e
                )),
            }
        }
    }

    /// Delete `id` unless a live dependency still targets it
    fn remove(&self, id: &AppId, protected: &mut ProtectedIds, outcome: &mut PublishOutcome) {
        let links = match self
            .policies
            .query
            .run("dependency listing", || self.directory.get_dependencies(id))
        {
            Ok(links) => links,
            Err(e) => {
                warn!("Cannot confirm {} is unused, keeping it: {}", id, e);
                protected.insert(id.clone());
                outcome.errors.push(format!("Dependency check of {} failed: {}", id, e));
                return;
            }
        };
        if let Some(link) = links.iter().find(|l| l.target_id == *id && l.source_id != *id) {
            info!("Keeping {}: required by {}", id, link.source_id);
            protected.insert(id.clone());
            return;
        }

        match self.policies.mutate.run("delete", || self.directory.delete(id)) {
            Ok(()) => {
                info!("Deleted {}", id);
                outcome.pruned.push(id.clone());
            }
            Err(e) => {
                warn!("Could not delete {}: {}", id, e);
                outcome.errors.push(format!("Deleting {} failed: {}", id, e));
            }
        }
    }
}

fn warn_on_detection_mismatch(candidate: &AppVersionObject) {
    let key = candidate.version_key();
    for rule in &candidate.detection_rules {
        if let Some(checked) = rule.checked_version()
            && VersionKey::parse(checked) != key
        {
            warn!(
                "{} detection rule checks version {} but {} publishes {}",
                rule.kind(),
                checked,
                candidate.id,
                candidate.version
            );
        }
    }
}
