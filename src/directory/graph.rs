// src/directory/graph.rs

//! Graph-style REST client for the directory contract
//!
//! Maps [`DirectoryService`] onto the `deviceAppManagement/mobileApps`
//! endpoints. Requests are blocking and not retried here: the engine owns
//! retry and verification policy, this client only classifies failures
//! (throttling and server errors are transient, other 4xx are rejections).

use super::detection::{Comparison, DetectionRule, FileCheck, Operator, RegistryCheck};
use super::token::TokenCache;
use super::{
    AppId, AppVersionObject, Assignment, AssignmentFilter, DependencyLink, DependencyType,
    DirectoryService, FilterMode, Intent, Notification, TimeWindow,
};
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default Graph endpoint
pub const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/beta";

/// Default timeout for HTTP requests (30 seconds)
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Pseudo group id for the "all devices" assignment target
pub const ALL_DEVICES: &str = "allDevices";

/// Pseudo group id for the "all licensed users" assignment target
pub const ALL_USERS: &str = "allLicensedUsers";

const DEPENDENCY_TYPE: &str = "#microsoft.graph.mobileAppDependency";

#[derive(Deserialize)]
struct Page<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphApp {
    id: String,
    #[serde(rename = "@odata.type", default)]
    odata_type: Option<String>,
    display_name: String,
    #[serde(default)]
    display_version: Option<String>,
    created_date_time: DateTime<Utc>,
    #[serde(default)]
    rules: Vec<GraphRule>,
}

impl GraphApp {
    fn into_object(self) -> AppVersionObject {
        let mut object = AppVersionObject::new(
            self.id,
            self.display_name,
            self.display_version.unwrap_or_default(),
            self.created_date_time,
        );
        for rule in self.rules {
            match rule.into_rule() {
                Ok(Some(rule)) => object.detection_rules.push(rule),
                Ok(None) => {}
                Err(e) => warn!("Skipping detection rule on {}: {}", object.id, e),
            }
        }
        object
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRule {
    #[serde(rename = "@odata.type")]
    odata_type: String,
    #[serde(default)]
    rule_type: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    file_or_folder_name: Option<String>,
    #[serde(rename = "check32BitOn64System", default)]
    check_32bit_on_64: Option<bool>,
    #[serde(default)]
    operation_type: Option<String>,
    #[serde(default)]
    operator: Option<String>,
    #[serde(default)]
    comparison_value: Option<String>,
    #[serde(default)]
    key_path: Option<String>,
    #[serde(default)]
    value_name: Option<String>,
    #[serde(default)]
    product_code: Option<String>,
    #[serde(default)]
    product_version_operator: Option<String>,
    #[serde(default)]
    product_version: Option<String>,
    #[serde(default)]
    script_content: Option<String>,
    #[serde(default)]
    enforce_signature_check: Option<bool>,
    #[serde(rename = "runAs32Bit", default)]
    run_as_32bit: Option<bool>,
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    field.ok_or_else(|| Error::ParseError(format!("detection rule is missing {name}")))
}

impl GraphRule {
    fn comparison(&self) -> Result<Comparison> {
        let operator = self
            .operator
            .as_deref()
            .and_then(Operator::parse)
            .ok_or_else(|| Error::ParseError(format!("bad operator {:?}", self.operator)))?;
        let value = self
            .comparison_value
            .clone()
            .ok_or_else(|| Error::ParseError("comparison without value".to_string()))?;
        Ok(Comparison::new(operator, value))
    }

    /// Convert a wire rule; requirement rules yield `None`
    fn into_rule(self) -> Result<Option<DetectionRule>> {
        if self.rule_type.as_deref().is_some_and(|t| t != "detection") {
            return Ok(None);
        }
        let check_32bit_on_64 = self.check_32bit_on_64.unwrap_or(false);

        let rule = match self.odata_type.as_str() {
            "#microsoft.graph.win32LobAppFileSystemRule" => {
                let check = match self.operation_type.as_deref() {
                    Some("exists") => FileCheck::Exists,
                    Some("doesNotExist") => FileCheck::DoesNotExist,
                    Some("version") => FileCheck::Version(self.comparison()?),
                    Some("sizeInMB") => FileCheck::SizeInMb(self.comparison()?),
                    Some("modifiedDate") => FileCheck::ModifiedDate(self.comparison()?),
                    Some("createdDate") => FileCheck::CreatedDate(self.comparison()?),
                    other => {
                        return Err(Error::ParseError(format!("file check {:?}", other)));
                    }
                };
                DetectionRule::File {
                    path: required(self.path, "path")?,
                    name: required(self.file_or_folder_name, "fileOrFolderName")?,
                    check,
                    check_32bit_on_64,
                }
            }
            "#microsoft.graph.win32LobAppRegistryRule" => {
                let check = match self.operation_type.as_deref() {
                    Some("exists") => RegistryCheck::Exists,
                    Some("doesNotExist") => RegistryCheck::DoesNotExist,
                    Some("string") => RegistryCheck::String(self.comparison()?),
                    Some("integer") => RegistryCheck::Integer(self.comparison()?),
                    Some("version") => RegistryCheck::Version(self.comparison()?),
                    other => {
                        return Err(Error::ParseError(format!("registry check {:?}", other)));
                    }
                };
                DetectionRule::Registry {
                    key_path: required(self.key_path, "keyPath")?,
                    value_name: self.value_name.filter(|v| !v.is_empty()),
                    check,
                    check_32bit_on_64,
                }
            }
            "#microsoft.graph.win32LobAppProductCodeRule" => {
                let version = match (self.product_version_operator.as_deref(), self.product_version) {
                    (None | Some("notConfigured"), _) => None,
                    (Some(op), Some(value)) => {
                        let operator = Operator::parse(op)
                            .ok_or_else(|| Error::ParseError(format!("bad operator {op}")))?;
                        Some(Comparison::new(operator, value))
                    }
                    (Some(op), None) => {
                        return Err(Error::ParseError(format!("operator {op} without version")));
                    }
                };
                DetectionRule::ProductCode {
                    product_code: required(self.product_code, "productCode")?,
                    version,
                }
            }
            "#microsoft.graph.win32LobAppPowerShellScriptRule" => DetectionRule::Script {
                script_base64: required(self.script_content, "scriptContent")?,
                enforce_signature_check: self.enforce_signature_check.unwrap_or(false),
                run_as_32bit: self.run_as_32bit.unwrap_or(false),
            },
            other => {
                return Err(Error::ParseError(format!("unsupported rule type {other}")));
            }
        };
        Ok(Some(rule))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAssignment {
    #[serde(default)]
    id: Option<String>,
    intent: String,
    target: GraphTarget,
    #[serde(default)]
    settings: Option<GraphSettings>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphTarget {
    #[serde(rename = "@odata.type")]
    odata_type: String,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    device_and_app_management_assignment_filter_id: Option<String>,
    #[serde(default)]
    device_and_app_management_assignment_filter_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphSettings {
    #[serde(default)]
    notifications: Option<String>,
    #[serde(default)]
    install_time_settings: Option<GraphInstallTime>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphInstallTime {
    #[serde(default)]
    use_local_time: bool,
    #[serde(default)]
    start_date_time: Option<String>,
    #[serde(default)]
    deadline_date_time: Option<String>,
}

/// Parse a Graph timestamp, with or without offset, as a wall-clock value
fn parse_time(s: &str) -> Result<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| Error::ParseError(format!("invalid timestamp '{s}': {e}")))
}

fn format_time(t: NaiveDateTime, use_local_time: bool) -> String {
    if use_local_time {
        t.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

impl GraphAssignment {
    fn into_assignment(self) -> Result<Assignment> {
        let intent = match self.intent.as_str() {
            "available" => Intent::Available,
            "required" => Intent::Required,
            "uninstall" => Intent::Uninstall,
            other => return Err(Error::ParseError(format!("unsupported intent {other}"))),
        };

        let target_group_id = match self.target.odata_type.as_str() {
            "#microsoft.graph.groupAssignmentTarget" => required(self.target.group_id, "groupId")?,
            "#microsoft.graph.allDevicesAssignmentTarget" => ALL_DEVICES.to_string(),
            "#microsoft.graph.allLicensedUsersAssignmentTarget" => ALL_USERS.to_string(),
            other => return Err(Error::ParseError(format!("unsupported target {other}"))),
        };

        let filter = match (
            self.target.device_and_app_management_assignment_filter_id,
            self.target.device_and_app_management_assignment_filter_type.as_deref(),
        ) {
            (Some(id), Some("include")) => Some(AssignmentFilter {
                mode: FilterMode::Include,
                filter_id: id,
            }),
            (Some(id), Some("exclude")) => Some(AssignmentFilter {
                mode: FilterMode::Exclude,
                filter_id: id,
            }),
            _ => None,
        };

        let mut notifications = Notification::default();
        let mut window = None;
        if let Some(settings) = self.settings {
            notifications = match settings.notifications.as_deref() {
                Some("showReboot") => Notification::ShowReboot,
                Some("hideAll") => Notification::HideAll,
                _ => Notification::ShowAll,
            };
            if let Some(time) = settings.install_time_settings {
                window = Some(TimeWindow {
                    available_at: time.start_date_time.as_deref().map(parse_time).transpose()?,
                    deadline_at: time.deadline_date_time.as_deref().map(parse_time).transpose()?,
                    use_local_time: time.use_local_time,
                });
            }
        }

        Ok(Assignment {
            id: self.id,
            target_group_id,
            intent,
            notifications,
            window,
            filter,
        })
    }
}

/// Request body for creating `assignment`
fn assignment_body(assignment: &Assignment) -> Value {
    let mut target = match assignment.target_group_id.as_str() {
        ALL_DEVICES => json!({ "@odata.type": "#microsoft.graph.allDevicesAssignmentTarget" }),
        ALL_USERS => json!({ "@odata.type": "#microsoft.graph.allLicensedUsersAssignmentTarget" }),
        group => json!({
            "@odata.type": "#microsoft.graph.groupAssignmentTarget",
            "groupId": group,
        }),
    };
    match &assignment.filter {
        Some(filter) => {
            target["deviceAndAppManagementAssignmentFilterId"] = json!(filter.filter_id);
            target["deviceAndAppManagementAssignmentFilterType"] = json!(filter.mode.to_string());
        }
        None => {
            target["deviceAndAppManagementAssignmentFilterType"] = json!("none");
        }
    }

    let install_time = assignment.window.map(|w| {
        json!({
            "useLocalTime": w.use_local_time,
            "startDateTime": w.available_at.map(|t| format_time(t, w.use_local_time)),
            "deadlineDateTime": w.deadline_at.map(|t| format_time(t, w.use_local_time)),
        })
    });

    json!({
        "@odata.type": "#microsoft.graph.mobileAppAssignment",
        "intent": assignment.intent.to_string(),
        "target": target,
        "settings": {
            "@odata.type": "#microsoft.graph.win32LobAppAssignmentSettings",
            "notifications": assignment.notifications.to_string(),
            "installTimeSettings": install_time,
            "restartSettings": null,
            "deliveryOptimizationPriority": "notConfigured",
        },
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRelationship {
    #[serde(rename = "@odata.type")]
    odata_type: String,
    target_id: String,
    #[serde(default)]
    target_type: Option<String>,
    #[serde(default)]
    dependency_type: Option<String>,
    #[serde(default)]
    supersedence_type: Option<String>,
}

impl GraphRelationship {
    fn is_dependency(&self) -> bool {
        self.odata_type == DEPENDENCY_TYPE
    }

    /// Resolve the relationship as seen from `app` into a directed link
    fn to_link(&self, app: &AppId) -> DependencyLink {
        let dependency_type = match self.dependency_type.as_deref() {
            Some("autoInstall") => DependencyType::AutoInstall,
            _ => DependencyType::Detect,
        };
        let other = AppId::new(self.target_id.clone());
        match self.target_type.as_deref() {
            // `other` depends on `app`
            Some("parent") => DependencyLink::new(&other, app, dependency_type),
            _ => DependencyLink::new(app, &other, dependency_type),
        }
    }
}

fn dependency_body(link: &DependencyLink) -> Value {
    let dependency_type = match link.dependency_type {
        DependencyType::Detect => "detect",
        DependencyType::AutoInstall => "autoInstall",
    };
    json!({
        "@odata.type": DEPENDENCY_TYPE,
        "targetId": link.target_id.as_str(),
        "dependencyType": dependency_type,
    })
}

/// Directory client backed by a Graph-style REST API
pub struct GraphDirectory {
    http: Client,
    base_url: String,
    tokens: TokenCache,
}

impl GraphDirectory {
    /// Create a client for `base_url` authenticating through `tokens`
    pub fn new(base_url: &str, tokens: TokenCache) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| Error::ConfigError(format!("Invalid directory URL '{base_url}': {e}")))?;
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn app_url(&self, app: &AppId) -> String {
        format!("{}/deviceAppManagement/mobileApps/{}", self.base_url, app)
    }

    fn send(&self, request: RequestBuilder) -> Result<Response> {
        let bearer = self.tokens.bearer()?;
        let response = request
            .bearer_auth(bearer)
            .send()
            .map_err(|e| Error::DirectoryError(format!("Request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().to_string();
        let body = response.text().unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(Error::NotFound(url)),
            StatusCode::UNAUTHORIZED => {
                // Token revoked or rotated early; fetch a new one next time
                self.tokens.invalidate();
                Err(Error::DirectoryError(format!("HTTP 401 from {url}")))
            }
            s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
                Err(Error::DirectoryError(format!("HTTP {s} from {url}: {body}")))
            }
            s => Err(Error::Rejected(format!("HTTP {s} from {url}: {body}"))),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.send(self.http.get(url))?;
        response
            .json()
            .map_err(|e| Error::ParseError(format!("Invalid response from {url}: {e}")))
    }

    /// Follow `@odata.nextLink` until the collection is exhausted
    fn get_all<T: DeserializeOwned>(&self, first: RequestBuilder) -> Result<Vec<T>> {
        let response = self.send(first)?;
        let mut page: Page<T> = response
            .json()
            .map_err(|e| Error::ParseError(format!("Invalid collection response: {e}")))?;
        let mut items = std::mem::take(&mut page.value);

        while let Some(next) = page.next_link.take() {
            debug!("Following next link {}", next);
            page = self.get_json(&next)?;
            items.append(&mut page.value);
        }
        Ok(items)
    }

    fn relationships(&self, app: &AppId) -> Result<Vec<GraphRelationship>> {
        let url = format!("{}/relationships", self.app_url(app));
        self.get_all(self.http.get(&url))
    }

    fn raw_assignments(&self, app: &AppId) -> Result<Vec<GraphAssignment>> {
        let url = format!("{}/assignments", self.app_url(app));
        self.get_all(self.http.get(&url))
    }
}

impl DirectoryService for GraphDirectory {
    fn find_by_display_name(&self, name: &str) -> Result<Vec<AppVersionObject>> {
        let url = format!("{}/deviceAppManagement/mobileApps", self.base_url);
        let filter = format!("startswith(displayName,'{}')", name.replace('\'', "''"));
        let apps: Vec<GraphApp> = self.get_all(self.http.get(&url).query(&[("$filter", filter)]))?;

        let prefix = format!("{} (N-", name);
        let found: Vec<AppVersionObject> = apps
            .into_iter()
            .filter(|a| {
                a.display_name == name
                    || (a.display_name.starts_with(&prefix) && a.display_name.ends_with(')'))
            })
            .map(GraphApp::into_object)
            .collect();
        debug!("Found {} objects named {}", found.len(), name);
        Ok(found)
    }

    fn get_assignments(&self, app: &AppId) -> Result<Vec<Assignment>> {
        self.raw_assignments(app)?
            .into_iter()
            .map(GraphAssignment::into_assignment)
            .collect()
    }

    fn add_assignment(&self, app: &AppId, assignment: &Assignment) -> Result<()> {
        let url = format!("{}/assignments", self.app_url(app));
        self.send(self.http.post(&url).json(&assignment_body(assignment)))?;
        info!(
            "Requested {} assignment of {} to {}",
            assignment.intent, app, assignment.target_group_id
        );
        Ok(())
    }

    fn remove_assignment(&self, app: &AppId, group_id: &str) -> Result<()> {
        for assignment in self.get_assignments(app)? {
            if assignment.target_group_id != group_id {
                continue;
            }
            let Some(id) = assignment.id else { continue };
            let url = format!("{}/assignments/{}", self.app_url(app), id);
            match self.send(self.http.delete(&url)) {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn get_dependencies(&self, app: &AppId) -> Result<Vec<DependencyLink>> {
        Ok(self
            .relationships(app)?
            .iter()
            .filter(|r| r.is_dependency())
            .map(|r| r.to_link(app))
            .collect())
    }

    fn replace_dependency_list(&self, owner: &AppId, links: &[DependencyLink]) -> Result<()> {
        // The update call replaces every relationship the owner holds, so
        // supersedence entries have to be sent back unchanged.
        let mut relationships: Vec<Value> = self
            .relationships(owner)?
            .into_iter()
            .filter(|r| !r.is_dependency() && r.target_type.as_deref() != Some("parent"))
            .map(|r| {
                json!({
                    "@odata.type": r.odata_type,
                    "targetId": r.target_id,
                    "supersedenceType": r.supersedence_type,
                })
            })
            .collect();
        relationships.extend(links.iter().map(dependency_body));

        let url = format!("{}/updateRelationships", self.app_url(owner));
        self.send(
            self.http
                .post(&url)
                .json(&json!({ "relationships": relationships })),
        )?;
        Ok(())
    }

    fn rename(&self, app: &AppId, display_name: &str) -> Result<()> {
        // PATCH on mobileApps must name the concrete app type
        let current: GraphApp = self.get_json(&self.app_url(app))?;
        let odata_type = current
            .odata_type
            .unwrap_or_else(|| "#microsoft.graph.win32LobApp".to_string());

        self.send(self.http.patch(self.app_url(app)).json(&json!({
            "@odata.type": odata_type,
            "displayName": display_name,
        })))?;
        info!("Renamed {} to {}", app, display_name);
        Ok(())
    }

    fn delete(&self, app: &AppId) -> Result<()> {
        self.send(self.http.delete(self.app_url(app)))?;
        info!("Deleted {}", app);
        Ok(())
    }
}
