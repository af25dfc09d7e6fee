//! Fleetbot Backend
//!
//! Device-management backend collaborator: the trait the command engine
//! consumes plus the Jamf Pro REST implementation.

mod jamf;

pub use jamf::{normalize_category, JamfClient};

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Attribute bag returned for one inventory category. Its shape depends on
/// the category, so it stays untyped.
pub type AttributeBag = serde_json::Value;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend rejected credentials: {0}")]
    Unauthorized(String),

    #[error("entity '{0}' not found")]
    EntityNotFound(String),

    #[error("category '{0}' not found in the computer details")]
    CategoryNotFound(String),

    #[error("account '{0}' not found")]
    AccountNotFound(String),

    #[error("group '{0}' not found")]
    GroupNotFound(String),

    #[error("unexpected response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },

    #[error("backend returned {status} for {endpoint}: {body}")]
    Status {
        status: u16,
        endpoint: String,
        body: String,
    },

    #[error("operation '{0}' is not supported by this backend")]
    Unsupported(&'static str),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::EntityNotFound(_)
                | Self::CategoryNotFound(_)
                | Self::AccountNotFound(_)
                | Self::GroupNotFound(_)
        )
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A managed device as listed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub id: u64,
    pub name: String,
}

impl Entity {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Records whose name carries `reserved` are system placeholders and are
    /// left out of fleet-wide work.
    pub fn is_synthetic(&self, reserved: Option<char>) -> bool {
        reserved.is_some_and(|c| self.name.contains(c))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountPrivileges {
    pub privileges: HashSet<String>,
    pub access_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckIn {
    pub user: String,
    pub last_contact: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralRecord {
    pub id: u64,
    pub name: String,
    pub serial_number: String,
    pub last_contact: Option<NaiveDateTime>,
    pub last_enrolled: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PolicyLog {
    #[serde(default, deserialize_with = "lenient_string")]
    pub policy_name: String,
    #[serde(default, rename = "date_completed", deserialize_with = "lenient_string")]
    pub completed: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AppRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub version: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub size_mb: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub deployed: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AppStoreHistory {
    #[serde(default)]
    pub installed: Vec<AppRecord>,
    #[serde(default)]
    pub pending: Vec<AppRecord>,
    #[serde(default)]
    pub failed: Vec<AppRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MdmCommand {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub completed: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub issued: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub last_push: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CommandHistory {
    #[serde(default)]
    pub completed: Vec<MdmCommand>,
    #[serde(default)]
    pub pending: Vec<MdmCommand>,
    #[serde(default)]
    pub failed: Vec<MdmCommand>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ComputerHistory {
    #[serde(default)]
    pub policy_logs: Vec<PolicyLog>,
    #[serde(default, rename = "mac_app_store_applications")]
    pub app_store: AppStoreHistory,
    #[serde(default)]
    pub commands: CommandHistory,
}

/// A script-like record: policy scripts and extension attributes share it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ScriptRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, rename = "scriptContents", deserialize_with = "lenient_string")]
    pub contents: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conjunction {
    And,
    Or,
}

impl Conjunction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

/// Accepts strings, numbers, booleans and null; the classic API is not
/// consistent about which one it sends.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Parse a backend timestamp. The classic API sends `2024-01-31 08:15:00`,
/// the v1 API RFC 3339, enrollment dates `2024-01-31T08:15:00.000+0000`.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(ts);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_utc());
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.naive_utc());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

#[async_trait::async_trait]
pub trait FleetBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn list_entities(&self) -> Result<Vec<Entity>, BackendError>;

    async fn entity_detail(&self, id: u64, category: &str) -> Result<AttributeBag, BackendError>;

    async fn account_privileges(&self, account: &str) -> Result<AccountPrivileges, BackendError>;

    async fn group_member_count(&self, group: &str) -> Result<usize, BackendError> {
        let _ = group;
        Err(BackendError::Unsupported("group_member_count"))
    }

    async fn create_smart_group(
        &self,
        group: &str,
        criterion: &str,
        conjunction: Conjunction,
    ) -> Result<(), BackendError> {
        let _ = (group, criterion, conjunction);
        Err(BackendError::Unsupported("create_smart_group"))
    }

    async fn create_static_group(
        &self,
        group: &str,
        serial_numbers: &[String],
    ) -> Result<(), BackendError> {
        let _ = (group, serial_numbers);
        Err(BackendError::Unsupported("create_static_group"))
    }

    async fn last_check_in(&self, id: u64) -> Result<CheckIn, BackendError> {
        let _ = id;
        Err(BackendError::Unsupported("last_check_in"))
    }

    async fn computer_history(&self, id: u64) -> Result<ComputerHistory, BackendError> {
        let _ = id;
        Err(BackendError::Unsupported("computer_history"))
    }

    async fn general_record(&self, id: u64) -> Result<GeneralRecord, BackendError> {
        let _ = id;
        Err(BackendError::Unsupported("general_record"))
    }

    async fn recovery_key(&self, id: u64) -> Result<Option<String>, BackendError> {
        let _ = id;
        Err(BackendError::Unsupported("recovery_key"))
    }

    async fn recovery_lock_password(&self, id: u64) -> Result<Option<String>, BackendError> {
        let _ = id;
        Err(BackendError::Unsupported("recovery_lock_password"))
    }

    async fn device_lock(&self, id: u64, passcode: &str) -> Result<(), BackendError> {
        let _ = (id, passcode);
        Err(BackendError::Unsupported("device_lock"))
    }

    /// Returns the management command UUID.
    async fn redeploy_framework(&self, id: u64) -> Result<String, BackendError> {
        let _ = id;
        Err(BackendError::Unsupported("redeploy_framework"))
    }

    async fn flush_commands(&self, id: u64) -> Result<(), BackendError> {
        let _ = id;
        Err(BackendError::Unsupported("flush_commands"))
    }

    async fn scripts(&self) -> Result<Vec<ScriptRecord>, BackendError> {
        Err(BackendError::Unsupported("scripts"))
    }

    async fn extension_attributes(&self) -> Result<Vec<ScriptRecord>, BackendError> {
        Err(BackendError::Unsupported("extension_attributes"))
    }

    async fn files(&self) -> Result<Vec<String>, BackendError> {
        Err(BackendError::Unsupported("files"))
    }

    async fn file_link(&self, file_name: &str) -> Result<String, BackendError> {
        let _ = file_name;
        Err(BackendError::Unsupported("file_link"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn synthetic_entities_detected_by_reserved_char() {
        let e = Entity::new(1, "lab_imaging");
        assert!(e.is_synthetic(Some('_')));
        assert!(!e.is_synthetic(None));
        assert!(!Entity::new(2, "alice-mbp").is_synthetic(Some('_')));
    }

    #[test]
    fn parses_all_backend_timestamp_shapes() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 31)
            .and_then(|d| d.and_hms_opt(8, 15, 0))
            .expect("valid date");
        assert_eq!(parse_timestamp("2024-01-31 08:15:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-31T08:15:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-31T08:15:00.000+0000"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-31T08:15:00"), Some(expected));
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn computer_history_tolerates_mixed_value_types() {
        let json = r#"{
            "policy_logs": [{"policy_name": "Install Zoom", "date_completed": "2024-02-01 10:00:00", "status": "Completed"}],
            "mac_app_store_applications": {
                "installed": [{"name": "Xcode.app", "version": "15.2", "size_mb": 8123}],
                "pending": [],
                "failed": [{"name": "Slack.app", "version": null, "status": "Failed"}]
            },
            "commands": {"completed": [{"name": "DeviceLock", "completed": "2024-02-02"}]}
        }"#;
        let history: ComputerHistory = serde_json::from_str(json).expect("decode");
        assert_eq!(history.policy_logs[0].completed, "2024-02-01 10:00:00");
        assert_eq!(history.app_store.installed[0].size_mb, "8123");
        assert_eq!(history.app_store.failed[0].version, "");
        assert_eq!(history.commands.completed[0].name, "DeviceLock");
        assert!(history.commands.pending.is_empty());
    }

    #[test]
    fn not_found_classification() {
        assert!(BackendError::EntityNotFound("x".into()).is_not_found());
        assert!(BackendError::GroupNotFound("x".into()).is_not_found());
        assert!(!BackendError::Unavailable("x".into()).is_not_found());
        assert!(BackendError::Unavailable("x".into()).is_unavailable());
    }
}
