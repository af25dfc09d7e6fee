//! Jamf Pro client (classic `JSSResource` plus `/api/v1`)

use crate::{
    parse_timestamp, AccountPrivileges, AttributeBag, BackendError, CheckIn, ComputerHistory,
    Conjunction, Entity, FleetBackend, GeneralRecord, ScriptRecord,
};
use fleetbot_config::BackendConfig;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

const SCRIPT_PAGE_SIZE: usize = 100;
/// Refresh this long before the backend says the token expires.
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);
const ERROR_BODY_PREVIEW_CHARS: usize = 300;

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now + TOKEN_EXPIRY_SLACK < at)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ComputerList {
    #[serde(default)]
    computers: Vec<Entity>,
}

#[derive(Debug, Deserialize)]
struct AccountEnvelope {
    account: AccountWire,
}

#[derive(Debug, Default, Deserialize)]
struct AccountWire {
    #[serde(default)]
    access_level: String,
    #[serde(default)]
    privileges: PrivilegesWire,
}

#[derive(Debug, Default, Deserialize)]
struct PrivilegesWire {
    #[serde(default)]
    jss_objects: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GroupEnvelope {
    computer_group: GroupWire,
}

#[derive(Debug, Default, Deserialize)]
struct GroupWire {
    #[serde(default)]
    computers: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ComputerEnvelope {
    computer: ComputerWire,
}

#[derive(Debug, Default, Deserialize)]
struct ComputerWire {
    #[serde(default)]
    general: GeneralWire,
    #[serde(default)]
    location: LocationWire,
}

#[derive(Debug, Default, Deserialize)]
struct GeneralWire {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    serial_number: String,
    #[serde(default)]
    last_contact_time: String,
    #[serde(default)]
    last_enrolled_date_utc: String,
}

#[derive(Debug, Default, Deserialize)]
struct LocationWire {
    #[serde(default)]
    real_name: String,
}

#[derive(Debug, Deserialize)]
struct HistoryEnvelope {
    computer_history: ComputerHistory,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(rename = "totalCount", default)]
    total_count: usize,
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct FileVaultWire {
    #[serde(rename = "personalRecoveryKey", default)]
    personal_recovery_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LockPasswordWire {
    #[serde(rename = "recoveryLockPassword", default)]
    recovery_lock_password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RedeployWire {
    #[serde(rename = "commandUuid", default)]
    command_uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileWire {
    #[serde(rename = "fileName", default)]
    file_name: String,
}

#[derive(Debug, Deserialize)]
struct FileLinkWire {
    #[serde(default)]
    uri: Option<String>,
}

/// Inventory-detail section names are camelCase; operators type them in any
/// case. `location` is an alias for `userAndLocation`.
pub fn normalize_category(category: &str) -> String {
    let category = category.trim();
    if category.eq_ignore_ascii_case("groupMemberships") {
        return "groupMemberships".to_string();
    }
    match category.to_lowercase().as_str() {
        "location" | "userandlocation" => "userAndLocation".to_string(),
        "diskencryption" => "diskEncryption".to_string(),
        "localuseraccounts" => "localUserAccounts".to_string(),
        "extensionattributes" => "extensionAttributes".to_string(),
        "operatingsystem" => "operatingSystem".to_string(),
        "configurationprofiles" => "configurationProfiles".to_string(),
        lower => lower.to_string(),
    }
}

fn pick_category(mut detail: AttributeBag, category: &str) -> Result<AttributeBag, BackendError> {
    let key = normalize_category(category);
    detail
        .as_object_mut()
        .and_then(|map| map.remove(&key))
        .ok_or(BackendError::CategoryNotFound(key))
}

fn preview(body: &str) -> String {
    if body.chars().count() <= ERROR_BODY_PREVIEW_CHARS {
        body.to_string()
    } else {
        let head: String = body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
        format!("{}...", head)
    }
}

/// Turn a non-success status into the error the caller should see.
/// `not_found` is used for 404 so each call can name what was missing.
fn status_error(
    status: StatusCode,
    endpoint: &str,
    body: &str,
    not_found: impl FnOnce() -> BackendError,
) -> BackendError {
    if status == StatusCode::NOT_FOUND {
        not_found()
    } else if status == StatusCode::UNAUTHORIZED {
        BackendError::Unauthorized(format!("{} answered 401 after token refresh", endpoint))
    } else if status.is_server_error() {
        BackendError::Unavailable(format!("{} answered {}", endpoint, status.as_u16()))
    } else {
        BackendError::Status {
            status: status.as_u16(),
            endpoint: endpoint.to_string(),
            body: preview(body),
        }
    }
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn smart_group_xml(group: &str, criterion: &str, conjunction: Conjunction) -> String {
    let group = escape_xml(group);
    format!(
        "<computer_group><name>{group}</name><is_smart>true</is_smart><criteria><criterion>\
         <name>{criterion}</name><priority>0</priority><and_or>{and_or}</and_or>\
         <search_type>is</search_type><value>{group}</value>\
         <opening_paren>false</opening_paren><closing_paren>false</closing_paren>\
         </criterion></criteria></computer_group>",
        group = group,
        criterion = escape_xml(criterion),
        and_or = conjunction.as_str(),
    )
}

fn static_group_xml(group: &str, serial_numbers: &[String]) -> String {
    let computers: String = serial_numbers
        .iter()
        .map(|serial| {
            format!(
                "<computer><serial_number>{}</serial_number></computer>",
                escape_xml(serial)
            )
        })
        .collect();
    format!(
        "<computer_group><name>{}</name><is_smart>false</is_smart><computers>{}</computers></computer_group>",
        escape_xml(group),
        computers
    )
}

pub struct JamfClient {
    client: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<CachedToken>>,
}

impl JamfClient {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|e| anyhow::anyhow!("invalid backend base_url '{}': {}", config.base_url, e))?;
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token: RwLock::new(None),
        })
    }

    /// Obtain the first bearer token. Called once at startup so bad
    /// credentials fail the process instead of the first command.
    pub async fn init(&self) -> Result<(), BackendError> {
        let token = self.fetch_token().await?;
        *self.token.write().await = Some(token);
        info!("Backend token acquired for {}", self.base_url);
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Unavailable(format!("base url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fetch_token(&self) -> Result<CachedToken, BackendError> {
        let url = self.endpoint(&["api", "oauth", "token"])?;
        let response = self
            .client
            .post(url.clone())
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "client_credentials"),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Unavailable(format!("token body read failed: {}", e)))?;
        if !status.is_success() {
            return Err(if status.is_server_error() {
                BackendError::Unavailable(format!("token endpoint answered {}", status.as_u16()))
            } else {
                BackendError::Unauthorized(format!(
                    "failed to get API token, status {}",
                    status.as_u16()
                ))
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| BackendError::Decode {
            endpoint: url.path().to_string(),
            reason: e.to_string(),
        })?;
        Ok(CachedToken {
            value: parsed.access_token,
            expires_at: parsed
                .expires_in
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
        })
    }

    async fn bearer(&self) -> Result<String, BackendError> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref().filter(|t| t.is_fresh(Instant::now())) {
                return Ok(token.value.clone());
            }
        }

        let mut guard = self.token.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if let Some(token) = guard.as_ref().filter(|t| t.is_fresh(Instant::now())) {
            return Ok(token.value.clone());
        }
        debug!("Refreshing backend token");
        let token = self.fetch_token().await?;
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    async fn invalidate(&self, stale: &str) {
        let mut guard = self.token.write().await;
        if guard.as_ref().is_some_and(|t| t.value == stale) {
            *guard = None;
        }
    }

    /// Send one request. A 401 drops the cached token and the request is
    /// retried exactly once with a fresh one.
    async fn send(
        &self,
        method: Method,
        url: Url,
        xml: Option<&str>,
    ) -> Result<(StatusCode, String), BackendError> {
        let mut refreshed = false;
        loop {
            let token = self.bearer().await?;
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .bearer_auth(&token)
                .header(ACCEPT, "application/json");
            if let Some(body) = xml {
                request = request
                    .header(CONTENT_TYPE, "application/xml")
                    .body(body.to_string());
            }

            let response = request.send().await.map_err(|e| {
                BackendError::Unavailable(format!("{} {} failed: {}", method, url.path(), e))
            })?;
            let status = response.status();
            let body = response.text().await.map_err(|e| {
                BackendError::Unavailable(format!("{} body read failed: {}", url.path(), e))
            })?;

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                warn!("Backend rejected token for {}, re-acquiring", url.path());
                self.invalidate(&token).await;
                refreshed = true;
                continue;
            }
            return Ok((status, body));
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        not_found: impl FnOnce() -> BackendError,
    ) -> Result<T, BackendError> {
        let endpoint = url.path().to_string();
        let (status, body) = self.send(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(status_error(status, &endpoint, &body, not_found));
        }
        serde_json::from_str(&body).map_err(|e| BackendError::Decode {
            endpoint,
            reason: e.to_string(),
        })
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        xml: Option<&str>,
        not_found: impl FnOnce() -> BackendError,
    ) -> Result<String, BackendError> {
        let endpoint = url.path().to_string();
        let (status, body) = self.send(method, url, xml).await?;
        if !status.is_success() {
            return Err(status_error(status, &endpoint, &body, not_found));
        }
        Ok(body)
    }

    async fn paged_scripts(&self, resource: &str, sort: &str) -> Result<Vec<ScriptRecord>, BackendError> {
        let mut all = Vec::new();
        let mut page = 0usize;
        loop {
            let mut url = self.endpoint(&["api", "v1", resource])?;
            url.query_pairs_mut()
                .append_pair("page", &page.to_string())
                .append_pair("page-size", &SCRIPT_PAGE_SIZE.to_string())
                .append_pair("sort", sort);
            let batch: Page<ScriptRecord> = self
                .get_json(url, || BackendError::EntityNotFound(resource.to_string()))
                .await?;
            let fetched = batch.results.len();
            all.extend(batch.results);
            if fetched < SCRIPT_PAGE_SIZE || all.len() >= batch.total_count {
                break;
            }
            page += 1;
        }
        Ok(all)
    }
}

#[async_trait::async_trait]
impl FleetBackend for JamfClient {
    fn name(&self) -> &str {
        "jamf"
    }

    async fn list_entities(&self) -> Result<Vec<Entity>, BackendError> {
        let url = self.endpoint(&["JSSResource", "computers"])?;
        let list: ComputerList = self
            .get_json(url, || BackendError::EntityNotFound("computers".into()))
            .await?;
        Ok(list.computers)
    }

    async fn entity_detail(&self, id: u64, category: &str) -> Result<AttributeBag, BackendError> {
        let id_str = id.to_string();
        let url = self.endpoint(&["api", "v1", "computers-inventory-detail", &id_str])?;
        let detail: AttributeBag = self
            .get_json(url, || BackendError::EntityNotFound(id_str.clone()))
            .await?;
        pick_category(detail, category)
    }

    async fn account_privileges(&self, account: &str) -> Result<AccountPrivileges, BackendError> {
        let url = self.endpoint(&["JSSResource", "accounts", "username", account])?;
        let envelope: AccountEnvelope = self
            .get_json(url, || BackendError::AccountNotFound(account.to_string()))
            .await?;
        Ok(AccountPrivileges {
            privileges: envelope.account.privileges.jss_objects.into_iter().collect(),
            access_level: envelope.account.access_level,
        })
    }

    async fn group_member_count(&self, group: &str) -> Result<usize, BackendError> {
        let url = self.endpoint(&["JSSResource", "computergroups", "name", group])?;
        let envelope: GroupEnvelope = self
            .get_json(url, || BackendError::GroupNotFound(group.to_string()))
            .await?;
        Ok(envelope.computer_group.computers.len())
    }

    async fn create_smart_group(
        &self,
        group: &str,
        criterion: &str,
        conjunction: Conjunction,
    ) -> Result<(), BackendError> {
        // id 0 lets the server assign the next free id
        let url = self.endpoint(&["JSSResource", "computergroups", "id", "0"])?;
        let xml = smart_group_xml(group, criterion, conjunction);
        self.execute(Method::POST, url, Some(&xml), || {
            BackendError::GroupNotFound(group.to_string())
        })
        .await?;
        info!("Smart group '{}' created", group);
        Ok(())
    }

    async fn create_static_group(
        &self,
        group: &str,
        serial_numbers: &[String],
    ) -> Result<(), BackendError> {
        let url = self.endpoint(&["JSSResource", "computergroups", "id", "0"])?;
        let xml = static_group_xml(group, serial_numbers);
        self.execute(Method::POST, url, Some(&xml), || {
            BackendError::GroupNotFound(group.to_string())
        })
        .await?;
        info!("Static group '{}' created with {} computers", group, serial_numbers.len());
        Ok(())
    }

    async fn last_check_in(&self, id: u64) -> Result<CheckIn, BackendError> {
        let id_str = id.to_string();
        let url = self.endpoint(&["JSSResource", "computers", "id", &id_str])?;
        let envelope: ComputerEnvelope = self
            .get_json(url, || BackendError::EntityNotFound(id_str.clone()))
            .await?;
        Ok(CheckIn {
            user: envelope.computer.location.real_name,
            last_contact: parse_timestamp(&envelope.computer.general.last_contact_time),
        })
    }

    async fn computer_history(&self, id: u64) -> Result<ComputerHistory, BackendError> {
        let id_str = id.to_string();
        let url = self.endpoint(&["JSSResource", "computerhistory", "id", &id_str])?;
        let envelope: HistoryEnvelope = self
            .get_json(url, || BackendError::EntityNotFound(id_str.clone()))
            .await?;
        Ok(envelope.computer_history)
    }

    async fn general_record(&self, id: u64) -> Result<GeneralRecord, BackendError> {
        let id_str = id.to_string();
        let url = self.endpoint(&["JSSResource", "computers", "id", &id_str])?;
        let envelope: ComputerEnvelope = self
            .get_json(url, || BackendError::EntityNotFound(id_str.clone()))
            .await?;
        let general = envelope.computer.general;
        Ok(GeneralRecord {
            id: if general.id == 0 { id } else { general.id },
            name: general.name,
            serial_number: general.serial_number,
            last_contact: parse_timestamp(&general.last_contact_time),
            last_enrolled: parse_timestamp(&general.last_enrolled_date_utc),
        })
    }

    async fn recovery_key(&self, id: u64) -> Result<Option<String>, BackendError> {
        let id_str = id.to_string();
        let url = self.endpoint(&["api", "v1", "computers-inventory", &id_str, "filevault"])?;
        let wire: FileVaultWire = self
            .get_json(url, || BackendError::EntityNotFound(id_str.clone()))
            .await?;
        Ok(wire.personal_recovery_key.filter(|k| !k.is_empty()))
    }

    async fn recovery_lock_password(&self, id: u64) -> Result<Option<String>, BackendError> {
        let id_str = id.to_string();
        let url = self.endpoint(&[
            "api",
            "v1",
            "computers-inventory",
            &id_str,
            "view-recovery-lock-password",
        ])?;
        let wire: LockPasswordWire = self
            .get_json(url, || BackendError::EntityNotFound(id_str.clone()))
            .await?;
        Ok(wire.recovery_lock_password.filter(|p| !p.is_empty()))
    }

    async fn device_lock(&self, id: u64, passcode: &str) -> Result<(), BackendError> {
        let id_str = id.to_string();
        let url = self.endpoint(&[
            "JSSResource",
            "computercommands",
            "command",
            "DeviceLock",
            "passcode",
            passcode,
            "id",
            &id_str,
        ])?;
        self.execute(Method::POST, url, None, || BackendError::EntityNotFound(id_str.clone()))
            .await?;
        Ok(())
    }

    async fn redeploy_framework(&self, id: u64) -> Result<String, BackendError> {
        let id_str = id.to_string();
        let url = self.endpoint(&["api", "v1", "jamf-management-framework", "redeploy", &id_str])?;
        let endpoint = url.path().to_string();
        let body = self
            .execute(Method::POST, url, None, || BackendError::EntityNotFound(id_str.clone()))
            .await?;
        let wire: RedeployWire = serde_json::from_str(&body).map_err(|e| BackendError::Decode {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;
        wire.command_uuid.ok_or(BackendError::Decode {
            endpoint,
            reason: "response carried no commandUuid".into(),
        })
    }

    async fn flush_commands(&self, id: u64) -> Result<(), BackendError> {
        let id_str = id.to_string();
        let url = self.endpoint(&[
            "JSSResource",
            "commandflush",
            "computers",
            "id",
            &id_str,
            "status",
            "Pending+Failed",
        ])?;
        self.execute(Method::DELETE, url, None, || BackendError::EntityNotFound(id_str.clone()))
            .await?;
        Ok(())
    }

    async fn scripts(&self) -> Result<Vec<ScriptRecord>, BackendError> {
        self.paged_scripts("scripts", "name:asc").await
    }

    async fn extension_attributes(&self) -> Result<Vec<ScriptRecord>, BackendError> {
        self.paged_scripts("computer-extension-attributes", "name.asc").await
    }

    async fn files(&self) -> Result<Vec<String>, BackendError> {
        let url = self.endpoint(&["api", "v1", "jcds", "files"])?;
        let files: Vec<FileWire> = self
            .get_json(url, || BackendError::EntityNotFound("jcds files".into()))
            .await?;
        Ok(files
            .into_iter()
            .map(|f| f.file_name)
            .filter(|name| !name.is_empty())
            .collect())
    }

    async fn file_link(&self, file_name: &str) -> Result<String, BackendError> {
        let url = self.endpoint(&["api", "v1", "jcds", "files", file_name])?;
        let endpoint = url.path().to_string();
        let wire: FileLinkWire = self
            .get_json(url, || BackendError::EntityNotFound(file_name.to_string()))
            .await?;
        wire.uri.ok_or(BackendError::Decode {
            endpoint,
            reason: "response carried no uri".into(),
        })
    }
}
