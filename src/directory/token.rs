// src/directory/token.rs

//! Bearer token handling for the Graph directory client
//!
//! Tokens come from the OAuth2 client-credentials grant. The cache hands out
//! the current token and fetches a fresh one shortly before it expires, so a
//! long publish run never presents an expired token mid-migration.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::fmt;
use tracing::{debug, info};

/// Default authority for the client-credentials grant
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Default scope requested for directory access
pub const DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Refresh this long before the reported expiry
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 300;

/// Application registration used to obtain tokens
#[derive(Clone)]
pub struct ClientCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// A bearer token and the instant it stops being accepted
#[derive(Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Whether the token should be replaced at `now`
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin >= self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Token source shared by every request of one directory client
pub struct TokenCache {
    http: Client,
    credentials: ClientCredentials,
    authority: String,
    scope: String,
    refresh_margin: Duration,
    current: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(http: Client, credentials: ClientCredentials) -> Self {
        Self {
            http,
            credentials,
            authority: DEFAULT_AUTHORITY.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            current: Mutex::new(None),
        }
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Seed the cache with an externally obtained token
    pub fn with_token(self, token: AccessToken) -> Self {
        *self.current.lock() = Some(token);
        self
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority.trim_end_matches('/'),
            self.credentials.tenant_id
        )
    }

    /// Current bearer token, refreshed when close to expiry
    pub fn bearer(&self) -> Result<String> {
        let mut current = self.current.lock();
        if let Some(token) = current.as_ref()
            && !token.needs_refresh(Utc::now(), self.refresh_margin)
        {
            return Ok(token.value.clone());
        }

        let token = self.fetch()?;
        let value = token.value.clone();
        *current = Some(token);
        Ok(value)
    }

    /// Drop the cached token so the next request fetches a new one
    pub fn invalidate(&self) {
        *self.current.lock() = None;
    }

    fn fetch(&self) -> Result<AccessToken> {
        let url = self.token_url();
        debug!("Requesting access token from {}", url);

        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .map_err(|e| Error::DirectoryError(format!("Token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::AuthError(format!("HTTP {} from {}: {}", status, url, body)));
        }

        let body: TokenResponse = response
            .json()
            .map_err(|e| Error::AuthError(format!("Invalid token response: {e}")))?;

        let expires_at = Utc::now() + Duration::seconds(body.expires_in);
        info!("Obtained access token valid until {}", expires_at);

        Ok(AccessToken {
            value: body.access_token,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn credentials() -> ClientCredentials {
        ClientCredentials {
            tenant_id: "contoso".to_string(),
            client_id: "client".to_string(),
            client_secret: "hunter2".to_string(),
        }
    }

    #[test]
    fn test_needs_refresh_within_margin() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let token = AccessToken {
            value: "t".to_string(),
            expires_at: now + Duration::minutes(10),
        };
        assert!(!token.needs_refresh(now, Duration::minutes(5)));
        assert!(token.needs_refresh(now + Duration::minutes(5), Duration::minutes(5)));
        assert!(token.needs_refresh(now + Duration::minutes(11), Duration::zero()));
    }

    #[test]
    fn test_seeded_token_is_reused() {
        let cache = TokenCache::new(Client::new(), credentials()).with_token(AccessToken {
            value: "seeded".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        });
        assert_eq!(cache.bearer().unwrap(), "seeded");
    }

    #[test]
    fn test_token_url() {
        let cache = TokenCache::new(Client::new(), credentials())
            .with_authority("https://login.example.com/");
        assert_eq!(cache.token_url(), "https://login.example.com/contoso/oauth2/v2.0/token");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", credentials());
        assert!(!rendered.contains("hunter2"));

        let token = AccessToken {
            value: "secret-token".to_string(),
            expires_at: Utc::now(),
        };
        assert!(!format!("{:?}", token).contains("secret-token"));
    }
}
