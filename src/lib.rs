// src/lib.rs

//! Application version rotation for device-management directories
//!
//! Publishes new application versions into a directory while keeping a
//! bounded, ordinally named history of older versions and moving group
//! assignments and dependency links onto whichever object takes over.
//!
//! # Architecture
//!
//! - Directory-first: every decision is taken from a fresh directory read
//! - Families: current object plus `"(N-k)"` suffixed predecessors
//! - Verified writes: each mutation is confirmed by polling reads
//! - Protection: objects something still depends on are never pruned

pub mod config;
pub mod directory;
mod error;
pub mod family;
pub mod migrate;
pub mod retry;
pub mod rotation;
pub mod version;

pub use config::AppRelayConfig;
pub use directory::{
    AppId, AppVersionObject, Assignment, DependencyLink, DirectoryService, GraphDirectory,
    MemoryDirectory,
};
pub use error::{Error, Result};
pub use family::{Family, FamilyResolver, ordinal_name, parse_ordinal};
pub use migrate::{DateOffsets, MigrationResult, Migrator, ProtectedIds};
pub use retry::{RetryPolicies, RetryPolicy, VerifiedWrite};
pub use rotation::{
    DefaultDeployment, PublishOutcome, PublishPolicy, PublishRequest, PublishStatus,
    RotationController, Validation, check,
};
pub use version::{LockPattern, VersionKey, compare_versions, is_locked};
