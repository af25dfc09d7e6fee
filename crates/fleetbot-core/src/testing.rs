//! In-memory collaborators for unit tests.

use fleetbot_backend::{
    normalize_category, AccountPrivileges, AttributeBag, BackendError, CheckIn, ComputerHistory,
    Conjunction, Entity, FleetBackend, GeneralRecord, ScriptRecord,
};
use fleetbot_slack::{ChatDelivery, ChatError, Content, IdentityLookup, MessageHandle};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct BackendState {
    accounts: HashMap<String, AccountPrivileges>,
    entities: Vec<Entity>,
    details: HashMap<(u64, String), AttributeBag>,
    check_ins: HashMap<u64, CheckIn>,
    histories: HashMap<u64, ComputerHistory>,
    general: HashMap<u64, GeneralRecord>,
    groups: HashMap<String, usize>,
    recovery_keys: HashMap<u64, String>,
    lock_passwords: HashMap<u64, String>,
    scripts: Option<Vec<ScriptRecord>>,
    extension_attributes: Vec<ScriptRecord>,
    files: Vec<String>,
    delays: HashMap<u64, Duration>,
    unavailable: HashSet<u64>,
    actions: Vec<String>,
}

/// Fleet backend double. Clones share state, so a test can keep one handle
/// for assertions while the code under test owns another.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(self, account: &str, privileges: &[&str]) -> Self {
        lock(&self.state).accounts.insert(
            account.to_string(),
            AccountPrivileges {
                privileges: privileges.iter().map(|p| p.to_string()).collect(),
                access_level: "Full Access".to_string(),
            },
        );
        self
    }

    pub fn with_entity(self, id: u64, name: &str) -> Self {
        lock(&self.state).entities.push(Entity::new(id, name));
        self
    }

    pub fn with_detail(self, id: u64, category: &str, bag: AttributeBag) -> Self {
        lock(&self.state)
            .details
            .insert((id, normalize_category(category)), bag);
        self
    }

    pub fn with_check_in(self, id: u64, user: &str, last_contact: Option<chrono::NaiveDateTime>) -> Self {
        lock(&self.state).check_ins.insert(
            id,
            CheckIn {
                user: user.to_string(),
                last_contact,
            },
        );
        self
    }

    pub fn with_history(self, id: u64, history: ComputerHistory) -> Self {
        lock(&self.state).histories.insert(id, history);
        self
    }

    pub fn with_general(self, record: GeneralRecord) -> Self {
        lock(&self.state).general.insert(record.id, record);
        self
    }

    pub fn with_group(self, name: &str, members: usize) -> Self {
        lock(&self.state).groups.insert(name.to_string(), members);
        self
    }

    pub fn with_recovery_key(self, id: u64, key: &str) -> Self {
        lock(&self.state).recovery_keys.insert(id, key.to_string());
        self
    }

    pub fn with_lock_password(self, id: u64, password: &str) -> Self {
        lock(&self.state).lock_passwords.insert(id, password.to_string());
        self
    }

    pub fn with_script(self, name: &str, contents: &str) -> Self {
        let record = ScriptRecord {
            id: String::new(),
            name: name.to_string(),
            contents: contents.to_string(),
        };
        lock(&self.state).scripts.get_or_insert_with(Vec::new).push(record);
        self
    }

    pub fn with_extension_attribute(self, name: &str, contents: &str) -> Self {
        lock(&self.state).extension_attributes.push(ScriptRecord {
            id: String::new(),
            name: name.to_string(),
            contents: contents.to_string(),
        });
        self
    }

    pub fn with_file(self, name: &str) -> Self {
        lock(&self.state).files.push(name.to_string());
        self
    }

    /// Every per-entity call for `id` sleeps this long first.
    pub fn with_delay(self, id: u64, delay: Duration) -> Self {
        lock(&self.state).delays.insert(id, delay);
        self
    }

    /// Every per-entity call for `id` fails as if the backend were down.
    pub fn with_unavailable(self, id: u64) -> Self {
        lock(&self.state).unavailable.insert(id);
        self
    }

    /// State-changing calls in the order they were made.
    pub fn actions(&self) -> Vec<String> {
        lock(&self.state).actions.clone()
    }

    pub fn group_count(&self, name: &str) -> Option<usize> {
        lock(&self.state).groups.get(name).copied()
    }

    async fn touch(&self, id: u64) -> Result<(), BackendError> {
        let (delay, down, known) = {
            let state = lock(&self.state);
            (
                state.delays.get(&id).copied(),
                state.unavailable.contains(&id),
                state.entities.iter().any(|e| e.id == id),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if down {
            return Err(BackendError::Unavailable(format!("computer {} timed out", id)));
        }
        if !known {
            return Err(BackendError::EntityNotFound(id.to_string()));
        }
        Ok(())
    }

    fn record(&self, action: String) {
        lock(&self.state).actions.push(action);
    }
}

#[async_trait::async_trait]
impl FleetBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list_entities(&self) -> Result<Vec<Entity>, BackendError> {
        Ok(lock(&self.state).entities.clone())
    }

    async fn entity_detail(&self, id: u64, category: &str) -> Result<AttributeBag, BackendError> {
        self.touch(id).await?;
        let key = normalize_category(category);
        lock(&self.state)
            .details
            .get(&(id, key.clone()))
            .cloned()
            .ok_or(BackendError::CategoryNotFound(key))
    }

    async fn account_privileges(&self, account: &str) -> Result<AccountPrivileges, BackendError> {
        lock(&self.state)
            .accounts
            .get(account)
            .cloned()
            .ok_or_else(|| BackendError::AccountNotFound(account.to_string()))
    }

    async fn group_member_count(&self, group: &str) -> Result<usize, BackendError> {
        lock(&self.state)
            .groups
            .get(group)
            .copied()
            .ok_or_else(|| BackendError::GroupNotFound(group.to_string()))
    }

    async fn create_smart_group(
        &self,
        group: &str,
        criterion: &str,
        conjunction: Conjunction,
    ) -> Result<(), BackendError> {
        self.record(format!("smart:{}:{}:{}", group, criterion, conjunction.as_str()));
        lock(&self.state).groups.insert(group.to_string(), 0);
        Ok(())
    }

    async fn create_static_group(
        &self,
        group: &str,
        serial_numbers: &[String],
    ) -> Result<(), BackendError> {
        self.record(format!("static:{}:{}", group, serial_numbers.join(",")));
        lock(&self.state)
            .groups
            .insert(group.to_string(), serial_numbers.len());
        Ok(())
    }

    async fn last_check_in(&self, id: u64) -> Result<CheckIn, BackendError> {
        self.touch(id).await?;
        lock(&self.state)
            .check_ins
            .get(&id)
            .cloned()
            .ok_or(BackendError::EntityNotFound(id.to_string()))
    }

    async fn computer_history(&self, id: u64) -> Result<ComputerHistory, BackendError> {
        self.touch(id).await?;
        Ok(lock(&self.state)
            .histories
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn general_record(&self, id: u64) -> Result<GeneralRecord, BackendError> {
        self.touch(id).await?;
        lock(&self.state)
            .general
            .get(&id)
            .cloned()
            .ok_or(BackendError::EntityNotFound(id.to_string()))
    }

    async fn recovery_key(&self, id: u64) -> Result<Option<String>, BackendError> {
        self.touch(id).await?;
        Ok(lock(&self.state).recovery_keys.get(&id).cloned())
    }

    async fn recovery_lock_password(&self, id: u64) -> Result<Option<String>, BackendError> {
        self.touch(id).await?;
        Ok(lock(&self.state).lock_passwords.get(&id).cloned())
    }

    async fn device_lock(&self, id: u64, passcode: &str) -> Result<(), BackendError> {
        self.touch(id).await?;
        self.record(format!("lock:{}:{}", id, passcode));
        Ok(())
    }

    async fn redeploy_framework(&self, id: u64) -> Result<String, BackendError> {
        self.touch(id).await?;
        self.record(format!("redeploy:{}", id));
        Ok(format!("cmd-{}", id))
    }

    async fn flush_commands(&self, id: u64) -> Result<(), BackendError> {
        self.touch(id).await?;
        self.record(format!("flush:{}", id));
        Ok(())
    }

    async fn scripts(&self) -> Result<Vec<ScriptRecord>, BackendError> {
        lock(&self.state)
            .scripts
            .clone()
            .ok_or_else(|| BackendError::Unavailable("scripts endpoint returned 503".to_string()))
    }

    async fn extension_attributes(&self) -> Result<Vec<ScriptRecord>, BackendError> {
        Ok(lock(&self.state).extension_attributes.clone())
    }

    async fn files(&self) -> Result<Vec<String>, BackendError> {
        Ok(lock(&self.state).files.clone())
    }

    async fn file_link(&self, file_name: &str) -> Result<String, BackendError> {
        Ok(format!("https://cdn.example.com/{}", file_name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCall {
    Placeholder { conversation_id: String },
    Update { handle: MessageHandle, content: Content },
    ThreadReply { handle: MessageHandle, content: Content },
}

#[derive(Default)]
struct ChatState {
    users: HashMap<String, String>,
    calls: Vec<ChatCall>,
    next_ts: u64,
}

/// Chat double: answers identity lookups and records every delivery.
#[derive(Clone, Default)]
pub struct MockChat {
    state: Arc<Mutex<ChatState>>,
}

impl MockChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, caller_id: &str, email: &str) -> Self {
        lock(&self.state)
            .users
            .insert(caller_id.to_string(), email.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ChatCall> {
        lock(&self.state).calls.clone()
    }

    /// Text of every update and thread reply, in delivery order.
    pub fn delivered_text(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::Update { content, .. } | ChatCall::ThreadReply { content, .. } => {
                    Some(content.fallback_text())
                }
                ChatCall::Placeholder { .. } => None,
            })
            .collect()
    }

    pub fn last_update(&self) -> Option<Content> {
        self.calls().into_iter().rev().find_map(|call| match call {
            ChatCall::Update { content, .. } => Some(content),
            _ => None,
        })
    }
}

#[async_trait::async_trait]
impl ChatDelivery for MockChat {
    async fn post_placeholder(&self, conversation_id: &str) -> Result<MessageHandle, ChatError> {
        let mut state = lock(&self.state);
        state.next_ts += 1;
        let handle = MessageHandle::new(conversation_id, format!("1700000000.{:06}", state.next_ts));
        state.calls.push(ChatCall::Placeholder {
            conversation_id: conversation_id.to_string(),
        });
        Ok(handle)
    }

    async fn update_message(&self, handle: &MessageHandle, content: &Content) -> Result<(), ChatError> {
        lock(&self.state).calls.push(ChatCall::Update {
            handle: handle.clone(),
            content: content.clone(),
        });
        Ok(())
    }

    async fn post_thread_reply(
        &self,
        handle: &MessageHandle,
        content: &Content,
    ) -> Result<MessageHandle, ChatError> {
        let mut state = lock(&self.state);
        state.next_ts += 1;
        state.calls.push(ChatCall::ThreadReply {
            handle: handle.clone(),
            content: content.clone(),
        });
        Ok(MessageHandle::new(
            handle.conversation_id.clone(),
            format!("1700000000.{:06}", state.next_ts),
        ))
    }
}

#[async_trait::async_trait]
impl IdentityLookup for MockChat {
    async fn user_email(&self, caller_id: &str) -> Result<String, ChatError> {
        lock(&self.state)
            .users
            .get(caller_id)
            .cloned()
            .ok_or_else(|| ChatError::Api {
                method: "users.info".to_string(),
                error: "user_not_found".to_string(),
            })
    }
}
