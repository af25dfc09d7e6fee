//! Authorization gate: caller identity, backend privileges, command match.

use crate::error::CommandError;
use crate::parser::{parse, ParsedCommand};
use crate::registry::CommandRegistry;
use fleetbot_backend::{BackendError, FleetBackend};
use fleetbot_policy::{account_name_from_email, AuthorizationContext};
use fleetbot_slack::IdentityLookup;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AuthorizedCommand {
    pub context: AuthorizationContext,
    pub command: ParsedCommand,
}

#[derive(Clone)]
pub struct AuthorizationGate {
    identity: Arc<dyn IdentityLookup>,
    backend: Arc<dyn FleetBackend>,
    registry: Arc<CommandRegistry>,
    company_domain: String,
}

impl AuthorizationGate {
    pub fn new(
        identity: Arc<dyn IdentityLookup>,
        backend: Arc<dyn FleetBackend>,
        registry: Arc<CommandRegistry>,
        company_domain: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            backend,
            registry,
            company_domain: company_domain.into(),
        }
    }

    async fn resolve_context(&self, caller_id: &str) -> Result<AuthorizationContext, CommandError> {
        let email = self
            .identity
            .user_email(caller_id)
            .await
            .map_err(|e| CommandError::IdentityLookupFailed(e.to_string()))?;
        let account = account_name_from_email(&email, &self.company_domain).ok_or_else(|| {
            CommandError::IdentityLookupFailed(format!("no account name in '{}'", email))
        })?;

        let privileges = self
            .backend
            .account_privileges(&account)
            .await
            .map_err(|e| match e {
                BackendError::AccountNotFound(name) => CommandError::IdentityLookupFailed(format!(
                    "no backend account named '{}'",
                    name
                )),
                other => CommandError::from(other),
            })?;

        Ok(AuthorizationContext::new(
            caller_id,
            account,
            privileges.privileges,
            privileges.access_level,
        ))
    }

    /// Resolve who is asking, what they may do, and what they asked for.
    ///
    /// The context is rebuilt on every call. A command with missing arguments
    /// is reported as such only to callers allowed to run it.
    pub async fn authorize(
        &self,
        caller_id: &str,
        text: &str,
    ) -> Result<AuthorizedCommand, CommandError> {
        let context = self.resolve_context(caller_id).await?;
        debug!(
            "Caller {} resolved to account '{}' ({}), {} privileges",
            caller_id,
            context.account_name,
            context.access_level,
            context.privileges.len()
        );

        let (key, parsed) = match parse(&self.registry, text) {
            Ok(parsed) => (parsed.key.to_string(), Ok(parsed)),
            Err(CommandError::MissingArguments { command }) => {
                (command.clone(), Err(CommandError::MissingArguments { command }))
            }
            Err(other) => return Err(other),
        };

        let required = self
            .registry
            .get(&key)
            .map(|spec| spec.permissions)
            .unwrap_or(&[]);
        if !context.is_authorized(required) {
            info!(
                "Account '{}' denied '{}' (needs one of {:?})",
                context.account_name, key, required
            );
            return Err(CommandError::PermissionDenied { command: key });
        }

        Ok(AuthorizedCommand {
            context,
            command: parsed?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, MockChat};

    fn gate(backend: MockBackend, chat: MockChat) -> AuthorizationGate {
        AuthorizationGate::new(
            Arc::new(chat),
            Arc::new(backend),
            Arc::new(CommandRegistry::builtin().expect("registry")),
            "example.com",
        )
    }

    #[tokio::test]
    async fn read_computers_may_run_checkin() {
        let backend = MockBackend::new().with_account("alice", &["Read Computers"]);
        let chat = MockChat::new().with_user("U1", "alice@example.com");
        let authorized = gate(backend, chat)
            .authorize("U1", "checkin alice-laptop")
            .await
            .expect("authorized");
        assert_eq!(authorized.command.key, "checkin");
        assert_eq!(authorized.command.args, "alice-laptop");
        assert_eq!(authorized.context.account_name, "alice");
    }

    #[tokio::test]
    async fn missing_permission_is_denied() {
        let backend = MockBackend::new().with_account("alice", &["Read Computers"]);
        let chat = MockChat::new().with_user("U1", "alice@example.com");
        let err = gate(backend, chat)
            .authorize("U1", "devicelock alice-laptop 123456")
            .await
            .expect_err("denied");
        assert!(matches!(err, CommandError::PermissionDenied { ref command } if command == "devicelock"));
    }

    #[tokio::test]
    async fn unknown_text_is_not_a_permission_problem() {
        let backend = MockBackend::new().with_account("alice", &[]);
        let chat = MockChat::new().with_user("U1", "alice@example.com");
        let err = gate(backend, chat)
            .authorize("U1", "good morning")
            .await
            .expect_err("unknown");
        assert!(matches!(err, CommandError::UnknownCommand));
    }

    #[tokio::test]
    async fn missing_arguments_hidden_from_unauthorized_callers() {
        let chat = MockChat::new().with_user("U1", "alice@example.com");
        let backend = MockBackend::new().with_account("alice", &["Read Scripts"]);
        let err = gate(backend, chat.clone())
            .authorize("U1", "redeploy")
            .await
            .expect_err("denied");
        assert!(matches!(err, CommandError::PermissionDenied { .. }));

        let backend = MockBackend::new().with_account("alice", &["Update Computers"]);
        let err = gate(backend, chat)
            .authorize("U1", "redeploy")
            .await
            .expect_err("missing args");
        assert!(matches!(err, CommandError::MissingArguments { .. }));
    }

    #[tokio::test]
    async fn identity_failures_deny() {
        let backend = MockBackend::new().with_account("alice", &["Read Computers"]);
        let err = gate(backend.clone(), MockChat::new())
            .authorize("U404", "help")
            .await
            .expect_err("no such user");
        assert!(matches!(err, CommandError::IdentityLookupFailed(_)));

        let chat = MockChat::new().with_user("U2", "bob@example.com");
        let err = gate(backend, chat)
            .authorize("U2", "help")
            .await
            .expect_err("no backend account");
        assert!(matches!(err, CommandError::IdentityLookupFailed(ref m) if m.contains("bob")));
    }
}
