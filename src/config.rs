// src/config.rs
//! Configuration file parsing
//!
//! Supports TOML configuration files with the following sections:
//! - [tenant] - Directory tenant, app registration, Graph endpoint
//! - [retry] - Attempts and delays for directory calls and verification
//! - [publish] - Retention, lock pattern, date offsets, batch parallelism
//! - [[deployment]] - Default groups every new version is deployed to
//! - [architecture_filter] - Device filter attached to default deployments
//! - [apps.*] - Per-application overrides of the publish settings

use crate::directory::graph::{DEFAULT_BASE_URL, HTTP_TIMEOUT};
use crate::directory::token::{DEFAULT_AUTHORITY, DEFAULT_REFRESH_MARGIN_SECS, DEFAULT_SCOPE};
use crate::directory::{
    AssignmentFilter, ClientCredentials, FilterMode, GraphDirectory, Intent, Notification,
    TokenCache,
};
use crate::error::{Error, Result};
use crate::migrate::DateOffsets;
use crate::retry::{RetryPolicies, RetryPolicy, VerifiedWrite};
use crate::rotation::{DEFAULT_RETENTION, DefaultDeployment, PublishPolicy};
use crate::version::LockPattern;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppRelayConfig {
    #[serde(default)]
    pub tenant: TenantSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub publish: PublishSection,

    /// Default deployments
    #[serde(default)]
    pub deployment: Vec<DeploymentSection>,

    #[serde(default)]
    pub architecture_filter: Option<FilterSection>,

    /// Per-application overrides, keyed by display name
    #[serde(default)]
    pub apps: HashMap<String, AppSection>,
}

/// Directory tenant section
#[derive(Debug, Deserialize)]
pub struct TenantSection {
    #[serde(default)]
    pub tenant_id: String,

    #[serde(default)]
    pub client_id: String,

    /// Environment variable holding the client secret
    #[serde(default = "default_secret_env")]
    pub client_secret_env: String,

    #[serde(default = "default_graph_url")]
    pub graph_url: String,

    #[serde(default = "default_authority")]
    pub authority: String,

    /// OAuth scope requested for directory access
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Seconds before expiry at which the access token is renewed
    #[serde(default = "default_refresh_margin")]
    pub token_refresh_margin_secs: i64,
}

impl Default for TenantSection {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret_env: default_secret_env(),
            graph_url: default_graph_url(),
            authority: default_authority(),
            scope: default_scope(),
            token_refresh_margin_secs: default_refresh_margin(),
        }
    }
}

/// Retry section
#[derive(Debug, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,

    /// Reads issued to confirm each write
    #[serde(default = "default_attempts")]
    pub verify_attempts: u32,

    #[serde(default = "default_delay_secs")]
    pub verify_delay_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_secs: default_delay_secs(),
            verify_attempts: default_attempts(),
            verify_delay_secs: default_delay_secs(),
        }
    }
}

/// Publish section
#[derive(Debug, Deserialize)]
pub struct PublishSection {
    /// Older versions kept alongside current
    #[serde(default = "default_retention")]
    pub retention: usize,

    #[serde(default)]
    pub lock: Option<String>,

    #[serde(default)]
    pub force: bool,

    /// Days from today for re-created availability dates
    #[serde(default)]
    pub available_date_offset: i64,

    /// Days from today for re-created deadlines
    #[serde(default)]
    pub deadline_date_offset: i64,

    /// Publish independent applications concurrently
    #[serde(default)]
    pub parallel: bool,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            lock: None,
            force: false,
            available_date_offset: 0,
            deadline_date_offset: 0,
            parallel: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentSection {
    pub group: String,
    pub intent: Intent,
    #[serde(default)]
    pub notification: Notification,
}

impl DeploymentSection {
    fn to_deployment(&self) -> DefaultDeployment {
        DefaultDeployment {
            group_id: self.group.clone(),
            intent: self.intent,
            notifications: self.notification,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterSection {
    pub filter_id: String,
    #[serde(default = "default_filter_mode")]
    pub mode: FilterMode,
}

/// Overrides for one application; unset fields fall back to [publish]
#[derive(Debug, Default, Deserialize)]
pub struct AppSection {
    #[serde(default)]
    pub retention: Option<usize>,

    #[serde(default)]
    pub lock: Option<String>,

    #[serde(default)]
    pub force: Option<bool>,

    #[serde(default)]
    pub available_date_offset: Option<i64>,

    #[serde(default)]
    pub deadline_date_offset: Option<i64>,

    /// Replaces the global default deployments
    #[serde(default)]
    pub deployment: Option<Vec<DeploymentSection>>,
}

fn default_secret_env() -> String {
    "APPRELAY_CLIENT_SECRET".to_string()
}

fn default_graph_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_authority() -> String {
    DEFAULT_AUTHORITY.to_string()
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_refresh_margin() -> i64 {
    DEFAULT_REFRESH_MARGIN_SECS
}

fn default_attempts() -> u32 {
    crate::retry::DEFAULT_ATTEMPTS
}

fn default_delay_secs() -> u64 {
    crate::retry::DEFAULT_DELAY.as_secs()
}

fn default_retention() -> usize {
    DEFAULT_RETENTION
}

fn default_filter_mode() -> FilterMode {
    FilterMode::Include
}

impl AppRelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content).map_err(|e| match e {
            Error::ConfigError(msg) => Error::ConfigError(format!("{}: {}", path.display(), msg)),
            other => other,
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: AppRelayConfig =
            toml::from_str(content).map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.retry.attempts == 0 || self.retry.verify_attempts == 0 {
            return Err(Error::ConfigError(
                "retry.attempts and retry.verify_attempts must be at least 1".to_string(),
            ));
        }

        if self.tenant.token_refresh_margin_secs < 0 {
            return Err(Error::ConfigError(
                "tenant.token_refresh_margin_secs must not be negative".to_string(),
            ));
        }

        let locks = std::iter::once(("publish", self.publish.lock.as_deref())).chain(
            self.apps
                .iter()
                .map(|(name, app)| (name.as_str(), app.lock.as_deref())),
        );
        for (section, lock) in locks {
            if let Some(pattern) = lock.filter(|p| !p.trim().is_empty()) {
                LockPattern::compile(pattern.trim()).map_err(|e| {
                    Error::ConfigError(format!("Invalid lock in [{}]: {}", section, e))
                })?;
            }
        }

        let deployments = self.deployment.iter().chain(
            self.apps
                .values()
                .filter_map(|app| app.deployment.as_ref())
                .flatten(),
        );
        for deployment in deployments {
            if deployment.group.trim().is_empty() {
                return Err(Error::ConfigError(
                    "deployment.group must not be empty".to_string(),
                ));
            }
        }

        if let Some(filter) = &self.architecture_filter
            && filter.filter_id.trim().is_empty()
        {
            return Err(Error::ConfigError(
                "architecture_filter.filter_id must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Retry policies for every directory operation
    pub fn retry_policies(&self) -> RetryPolicies {
        let base = RetryPolicy::fixed(self.retry.attempts, Duration::from_secs(self.retry.delay_secs));
        let verify = RetryPolicy::fixed(
            self.retry.verify_attempts,
            Duration::from_secs(self.retry.verify_delay_secs),
        );
        RetryPolicies {
            query: base,
            write: VerifiedWrite {
                write: base,
                verify,
            },
            remove: base,
            mutate: base,
        }
    }

    /// Publish policy for `app`, with its overrides applied
    pub fn policy_for(&self, app: &str) -> PublishPolicy {
        let overrides = self.apps.get(app);
        let publish = &self.publish;

        let deployments = overrides
            .and_then(|o| o.deployment.as_ref())
            .unwrap_or(&self.deployment)
            .iter()
            .map(DeploymentSection::to_deployment)
            .collect();

        PublishPolicy {
            retention: overrides
                .and_then(|o| o.retention)
                .unwrap_or(publish.retention),
            lock: overrides
                .and_then(|o| o.lock.clone())
                .or_else(|| publish.lock.clone()),
            force: overrides.and_then(|o| o.force).unwrap_or(publish.force),
            offsets: DateOffsets::new(
                overrides
                    .and_then(|o| o.available_date_offset)
                    .unwrap_or(publish.available_date_offset),
                overrides
                    .and_then(|o| o.deadline_date_offset)
                    .unwrap_or(publish.deadline_date_offset),
            ),
            deployments,
            architecture_filter: self.architecture_filter.as_ref().map(|f| AssignmentFilter {
                mode: f.mode,
                filter_id: f.filter_id.clone(),
            }),
        }
    }

    /// App registration, with the secret read from the environment
    pub fn credentials(&self) -> Result<ClientCredentials> {
        let tenant = &self.tenant;
        if tenant.tenant_id.is_empty() || tenant.client_id.is_empty() {
            return Err(Error::ConfigError(
                "tenant.tenant_id and tenant.client_id are required".to_string(),
            ));
        }
        let client_secret = std::env::var(&tenant.client_secret_env).map_err(|_| {
            Error::ConfigError(format!(
                "Client secret variable {} is not set",
                tenant.client_secret_env
            ))
        })?;

        Ok(ClientCredentials {
            tenant_id: tenant.tenant_id.clone(),
            client_id: tenant.client_id.clone(),
            client_secret,
        })
    }

    /// Graph directory client for the configured tenant
    pub fn graph_directory(&self) -> Result<GraphDirectory> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to create HTTP client: {e}")))?;
        let tokens = self.token_cache(http, self.credentials()?);
        GraphDirectory::new(&self.tenant.graph_url, tokens)
    }

    /// Token cache for the configured authority, scope and refresh margin
    pub fn token_cache(&self, http: Client, credentials: ClientCredentials) -> TokenCache {
        TokenCache::new(http, credentials)
            .with_authority(&self.tenant.authority)
            .with_scope(&self.tenant.scope)
            .with_refresh_margin(chrono::Duration::seconds(self.tenant.token_refresh_margin_secs))
    }
}
