// tests/publish.rs

//! End-to-end publish scenarios against the in-memory directory.

mod common;

use apprelay::directory::{AssignmentFilter, DirectoryOp, FilterMode, Intent};
use apprelay::{
    AppId, DefaultDeployment, DirectoryService, FamilyResolver, MemoryDirectory, PublishPolicy,
    PublishRequest, PublishStatus, RetryPolicy, Validation,
};
use common::*;

fn policy(retention: usize) -> PublishPolicy {
    PublishPolicy {
        retention,
        ..Default::default()
    }
}

#[test]
fn test_publish_shifts_family_down_one_slot() {
    let dir = seeded_directory();
    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v2"), &policy(2));

    assert_eq!(outcome.status, PublishStatus::Clean, "{outcome}");
    assert_eq!(outcome.promoted, Some(AppId::from("v2")));
    assert!(outcome.pruned.is_empty());
    assert_eq!(
        names(&dir, "Tool"),
        vec![pair("v2", "Tool"), pair("v1", "Tool (N-1)"), pair("v0", "Tool (N-2)")]
    );

    // Deployments follow their slot
    assert_eq!(groups(&dir, "v2"), vec!["pilot"]);
    assert_eq!(groups(&dir, "v1"), vec!["legacy"]);
    assert!(groups(&dir, "v0").is_empty());
}

#[test]
fn test_publish_prunes_beyond_retention() {
    let dir = seeded_directory();
    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v2"), &policy(1));

    assert!(outcome.is_clean(), "{outcome}");
    assert_eq!(outcome.pruned, vec![AppId::from("v0")]);
    assert_eq!(names(&dir, "Tool"), vec![pair("v2", "Tool"), pair("v1", "Tool (N-1)")]);
    assert!(!dir.app_ids().contains(&AppId::from("v0")));
}

#[test]
fn test_unmoved_dependent_protects_member() {
    let dir = seeded_directory();
    dir.insert(dependent("consumer", "Consumer", &["v0"]));
    dir.fail_next(DirectoryOp::ReplaceDependencies, 100);

    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v2"), &policy(1));

    assert_eq!(outcome.status, PublishStatus::Degraded);
    assert!(outcome.pruned.is_empty());
    assert!(outcome.protected.contains(&AppId::from("v0")));
    assert_eq!(requires(&dir, "consumer"), vec!["v0"]);
    assert_eq!(names(&dir, "Tool").len(), 3);
}

#[test]
fn test_live_dependency_blocks_pruning_without_migration() {
    // No current object: slots are not cascaded, so the dependent is never re-pointed
    let dir = seeded_directory();
    dir.delete(&AppId::from("v1")).unwrap();
    dir.insert(dependent("consumer", "Consumer", &["v0"]));
    dir.clear_calls();

    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v2"), &policy(0));

    assert!(outcome.is_clean(), "{outcome}");
    assert!(!outcome.pruned.contains(&AppId::from("v0")));
    assert!(outcome.protected.contains(&AppId::from("v0")));
    assert_eq!(requires(&dir, "consumer"), vec!["v0"]);
}

#[test]
fn test_repointed_dependent_moves_with_cascade() {
    let dir = seeded_directory();
    dir.insert(dependent("consumer", "Consumer", &["v1"]));

    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v2"), &policy(1));

    assert!(outcome.is_clean(), "{outcome}");
    assert_eq!(requires(&dir, "consumer"), vec!["v2"]);
    assert!(outcome.protected.contains(&AppId::from("v2")));
    assert_eq!(outcome.pruned, vec![AppId::from("v0")]);
}

#[test]
fn test_forced_republish_replaces_existing_version() {
    let dir = seeded_directory();
    dir.delete(&AppId::from("v2")).unwrap();
    dir.insert(version_object("v1b", "Tool", "1.5", 30));
    dir.clear_calls();

    let skipped = controller(&dir).publish_app("Tool", &AppId::from("v1b"), &policy(2));
    assert!(matches!(
        skipped.status,
        PublishStatus::Skipped(Validation::AlreadyCurrent { .. })
    ));
    assert_eq!(dir.mutation_count(), 0);

    let forced = PublishPolicy {
        force: true,
        ..policy(2)
    };
    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v1b"), &forced);

    assert!(outcome.is_clean(), "{outcome}");
    assert_eq!(outcome.pruned, vec![AppId::from("v1")]);
    assert_eq!(groups(&dir, "v1b"), vec!["pilot"]);
    assert_eq!(names(&dir, "Tool"), vec![pair("v1b", "Tool"), pair("v0", "Tool (N-1)")]);
}

#[test]
fn test_conflict_with_residue_is_kept() {
    let dir = seeded_directory();
    dir.delete(&AppId::from("v2")).unwrap();
    dir.insert(version_object("v1b", "Tool", "1.5", 30));
    dir.ignore_adds_for("pilot");
    dir.clear_calls();

    let forced = PublishPolicy {
        force: true,
        ..policy(2)
    };
    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v1b"), &forced);

    assert_eq!(outcome.status, PublishStatus::Degraded);
    assert!(outcome.pruned.is_empty());
    assert!(outcome.protected.contains(&AppId::from("v1")));
    assert_eq!(groups(&dir, "v1"), vec!["pilot"]);
    assert_eq!(
        names(&dir, "Tool"),
        vec![pair("v1b", "Tool"), pair("v1", "Tool (N-1)"), pair("v0", "Tool (N-2)")]
    );
}

#[test]
fn test_repeated_publishes_keep_family_compact() {
    let dir = MemoryDirectory::new();
    dir.insert(deployed("r1", "Viewer", "1.0", 0, &["everyone"]));

    for (i, version) in ["1.1", "1.2", "2.0"].iter().enumerate() {
        let id = format!("r{}", i + 2);
        dir.insert(version_object(&id, "Viewer", version, (i as i64 + 1) * 10));
        let outcome = controller(&dir).publish_app("Viewer", &AppId::new(id.as_str()), &policy(2));
        assert!(outcome.is_clean(), "{outcome}");

        let family = FamilyResolver::new(&dir, RetryPolicy::immediate(1))
            .resolve("Viewer")
            .unwrap();
        assert!(family.is_compact());
        assert_eq!(family.unsuffixed().count(), 1);
        assert_eq!(family.current().unwrap().id.as_str(), id);
    }

    assert_eq!(
        names(&dir, "Viewer"),
        vec![pair("r4", "Viewer"), pair("r3", "Viewer (N-1)"), pair("r2", "Viewer (N-2)")]
    );
    assert_eq!(groups(&dir, "r4"), vec!["everyone"]);
}

#[test]
fn test_locked_and_downgraded_versions_are_skipped() {
    let dir = seeded_directory();
    let locked = PublishPolicy {
        lock: Some("1.x".to_string()),
        ..policy(2)
    };
    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v2"), &locked);
    assert!(matches!(outcome.status, PublishStatus::Skipped(Validation::Locked { .. })));

    dir.insert(version_object("old", "Tool", "1.2", 40));
    let outcome = controller(&dir).publish_app("Tool", &AppId::from("old"), &policy(2));
    assert!(matches!(outcome.status, PublishStatus::Skipped(Validation::Downgrade { .. })));

    assert_eq!(dir.mutation_count(), 0);
}

#[test]
fn test_default_deployments_added_once() {
    let dir = seeded_directory();
    let with_defaults = PublishPolicy {
        deployments: vec![
            DefaultDeployment::new("pilot", Intent::Required),
            DefaultDeployment::new("all-staff", Intent::Available),
        ],
        architecture_filter: Some(AssignmentFilter {
            mode: FilterMode::Include,
            filter_id: "x64".to_string(),
        }),
        ..policy(2)
    };
    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v2"), &with_defaults);
    assert!(outcome.is_clean(), "{outcome}");

    let v2 = dir.app(&AppId::from("v2")).unwrap();
    assert_eq!(v2.assignments.len(), 2);
    let staff = v2
        .assignments
        .iter()
        .find(|a| a.target_group_id == "all-staff")
        .unwrap();
    assert_eq!(staff.intent, Intent::Available);
    assert_eq!(staff.filter.as_ref().unwrap().filter_id, "x64");
}

#[test]
fn test_publish_survives_read_lag() {
    let dir = MemoryDirectory::with_read_lag(2);
    seed(&dir);
    dir.insert(dependent("consumer", "Consumer", &["v1"]));

    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v2"), &policy(2));

    assert!(outcome.is_clean(), "{outcome}");
    assert_eq!(groups(&dir, "v2"), vec!["pilot"]);
    assert_eq!(requires(&dir, "consumer"), vec!["v2"]);
}

#[test]
fn test_unreadable_family_fails_without_mutation() {
    let dir = seeded_directory();
    dir.fail_next(DirectoryOp::Find, 3);

    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v2"), &policy(2));

    assert!(outcome.is_failed());
    assert_eq!(dir.mutation_count(), 0);
}

#[test]
fn test_rename_failure_is_fatal() {
    let dir = seeded_directory();
    dir.fail_next(DirectoryOp::Rename, 3);

    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v2"), &policy(1));

    assert!(outcome.is_failed());
    assert!(outcome.pruned.is_empty());
    assert!(dir.app_ids().contains(&AppId::from("v0")));
}

#[test]
fn test_batch_isolates_families() {
    let dir = seeded_directory();
    dir.insert(deployed("w1", "Viewer", "3.0", 0, &["everyone"]));
    dir.insert(version_object("w2", "Viewer", "3.1", 5));

    let requests = vec![
        PublishRequest {
            name: "Tool".to_string(),
            app_id: AppId::from("v2"),
            policy: policy(2),
        },
        PublishRequest {
            name: "Missing".to_string(),
            app_id: AppId::from("nothing"),
            policy: policy(2),
        },
        PublishRequest {
            name: "Viewer".to_string(),
            app_id: AppId::from("w2"),
            policy: policy(2),
        },
    ];

    for parallel in [false, true] {
        let outcomes = controller(&dir).publish_batch(&requests, parallel);
        let apps: Vec<&str> = outcomes.iter().map(|o| o.application.as_str()).collect();
        assert_eq!(apps, vec!["Tool", "Missing", "Viewer"]);
        assert!(outcomes[1].is_failed());
        if !parallel {
            assert!(outcomes[0].is_clean(), "{}", outcomes[0]);
            assert!(outcomes[2].is_clean(), "{}", outcomes[2]);
        }
    }

    assert_eq!(names(&dir, "Viewer"), vec![pair("w2", "Viewer"), pair("w1", "Viewer (N-1)")]);
    assert_eq!(groups(&dir, "w2"), vec!["everyone"]);
}

#[test]
fn test_batch_runs_same_family_in_order() {
    let dir = seeded_directory();
    dir.insert(version_object("v3", "Tool", "3.0", 30));

    let requests: Vec<PublishRequest> = ["v2", "v3"]
        .iter()
        .map(|id| PublishRequest {
            name: "Tool".to_string(),
            app_id: AppId::from(*id),
            policy: policy(2),
        })
        .collect();

    // v3 is already registered when v2 runs, so v2 counts as a downgrade
    let outcomes = controller(&dir).publish_batch(&requests, true);
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(
        outcomes[0].status,
        PublishStatus::Skipped(Validation::Downgrade { .. })
    ));
    assert!(outcomes[1].is_clean(), "{}", outcomes[1]);
    assert_eq!(outcomes[1].pruned, vec![AppId::from("v0")]);
    assert_eq!(
        names(&dir, "Tool"),
        vec![pair("v3", "Tool"), pair("v2", "Tool (N-1)"), pair("v1", "Tool (N-2)")]
    );
    assert_eq!(groups(&dir, "v3"), vec!["pilot"]);
    // v0 handed its slot deployment to v2 before it was pruned
    assert_eq!(groups(&dir, "v2"), vec!["legacy"]);
}

#[test]
fn test_several_unsuffixed_members_all_promote() {
    let dir = MemoryDirectory::new();
    dir.insert(deployed("v0", "Tool (N-1)", "1.0", 0, &["legacy"]));
    dir.insert(deployed("v1a", "Tool", "1.5", 10, &["pilot"]));
    dir.insert(deployed("v1b", "Tool", "1.4", 15, &["ring"]));
    dir.insert(version_object("v2", "Tool", "2.0", 20));

    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v2"), &policy(2));
    assert!(outcome.is_clean(), "{outcome}");
    assert_eq!(outcome.pruned, vec![AppId::from("v0")]);

    // Both former current objects hand their groups to v2; the newer one
    // takes the N-1 slot and receives v0's deployment
    assert_eq!(groups(&dir, "v2"), vec!["pilot", "ring"]);
    assert_eq!(groups(&dir, "v1a"), vec!["legacy"]);
    assert!(groups(&dir, "v1b").is_empty());
    assert_eq!(
        names(&dir, "Tool"),
        vec![pair("v2", "Tool"), pair("v1a", "Tool (N-1)"), pair("v1b", "Tool (N-2)")]
    );

    let family = FamilyResolver::new(&dir, RetryPolicy::immediate(1))
        .resolve("Tool")
        .unwrap();
    assert!(family.is_compact());
}

#[test]
fn test_outcome_serializes_for_reports() {
    let dir = seeded_directory();
    let outcome = controller(&dir).publish_app("Tool", &AppId::from("v2"), &policy(1));

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["application"], "Tool");
    assert_eq!(json["status"]["status"], "clean");
    assert_eq!(json["pruned"][0], "v0");
    assert_eq!(json["renamed"].as_array().unwrap().len(), 2);
}
