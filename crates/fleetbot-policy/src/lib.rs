//! Fleetbot Policy Engine
//!
//! Per-command authorization context and conversation allow/deny lists

use fleetbot_config::PolicyConfig;
use serde::Serialize;
use std::collections::HashSet;

/// Who is asking and what the backend lets them do.
///
/// Built fresh for every command: privileges can change between two messages
/// from the same caller, so this is never cached.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationContext {
    pub caller_id: String,
    pub account_name: String,
    pub privileges: HashSet<String>,
    /// Informational only; decisions use `privileges`.
    pub access_level: String,
}

impl AuthorizationContext {
    pub fn new<I, S>(
        caller_id: impl Into<String>,
        account_name: impl Into<String>,
        privileges: I,
        access_level: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            caller_id: caller_id.into(),
            account_name: account_name.into(),
            privileges: privileges.into_iter().map(Into::into).collect(),
            access_level: access_level.into(),
        }
    }

    /// Authorized iff the caller holds at least one of `required`.
    pub fn is_authorized(&self, required: &[&str]) -> bool {
        required.iter().any(|perm| self.privileges.contains(*perm))
    }

    pub fn grant(&mut self, privilege: impl Into<String>) {
        self.privileges.insert(privilege.into());
    }
}

/// Map a chat e-mail to a backend account name by removing `@domain`.
///
/// Returns `None` when nothing usable is left.
pub fn account_name_from_email(email: &str, company_domain: &str) -> Option<String> {
    let email = email.trim();
    let domain = company_domain.trim().trim_start_matches('@');
    let account = if domain.is_empty() {
        email
    } else {
        let suffix = format!("@{}", domain);
        email
            .len()
            .checked_sub(suffix.len())
            .filter(|&start| {
                email
                    .get(start..)
                    .is_some_and(|tail| tail.eq_ignore_ascii_case(&suffix))
            })
            .map_or(email, |start| &email[..start])
    };
    let account = account.trim();
    if account.is_empty() {
        None
    } else {
        Some(account.to_string())
    }
}

#[derive(Clone, Default)]
pub struct ChannelPolicy {
    allowlist: HashSet<String>,
    denylist: HashSet<String>,
}

impl ChannelPolicy {
    pub fn new(config: Option<&PolicyConfig>) -> Self {
        let allowlist = config
            .map(|c| c.allowed_channels.iter().map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        let denylist = config
            .map(|c| c.denied_channels.iter().map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        Self {
            allowlist,
            denylist,
        }
    }

    pub fn is_allowed(&self, conversation_id: &str) -> bool {
        if self.denylist.contains(conversation_id) {
            return false;
        }

        if self.allowlist.is_empty() {
            return true;
        }

        self.allowlist.contains(conversation_id)
    }
}
