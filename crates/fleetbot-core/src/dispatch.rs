//! Dispatch controller: one inbound message from placeholder to final reply.

use crate::auth::AuthorizationGate;
use crate::error::CommandError;
use crate::fanout::FanOut;
use crate::format::Reply;
use crate::handlers::{HandlerContext, HandlerSettings, HandlerTable};
use crate::registry::CommandRegistry;
use chrono::{NaiveDateTime, Utc};
use fleetbot_backend::FleetBackend;
use fleetbot_config::Config;
use fleetbot_ipc::{EventDeduper, InboundEvent};
use fleetbot_slack::{ChatDelivery, ChatError, IdentityLookup, MessageHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

pub const UNKNOWN_COMMAND_NOTICE: &str =
    "Unknown command received: no permissions needed, but also no output! :cheers:";

/// Lifecycle of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Received,
    Parsed,
    Authorized,
    Executing,
    Delivered,
    Rejected,
    Failed,
}

impl DispatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Parsed => "PARSED",
            Self::Authorized => "AUTHORIZED",
            Self::Executing => "EXECUTING",
            Self::Delivered => "DELIVERED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Retry of an event already seen inside the dedup window. Nothing posted.
    Duplicate,
    Rejected { reason: String },
    Delivered { command: &'static str, messages: usize },
    Failed { command: Option<&'static str>, error: String },
}

impl DispatchOutcome {
    pub fn state(&self) -> Option<DispatchState> {
        match self {
            Self::Duplicate => None,
            Self::Rejected { .. } => Some(DispatchState::Rejected),
            Self::Delivered { .. } => Some(DispatchState::Delivered),
            Self::Failed { .. } => Some(DispatchState::Failed),
        }
    }
}

pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub struct Dispatcher {
    gate: AuthorizationGate,
    handlers: Arc<HandlerTable>,
    chat: Arc<dyn ChatDelivery>,
    backend: Arc<dyn FleetBackend>,
    registry: Arc<CommandRegistry>,
    settings: Arc<HandlerSettings>,
    fanout: FanOut,
    deduper: EventDeduper,
    clock: Clock,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        backend: Arc<dyn FleetBackend>,
        chat: Arc<dyn ChatDelivery>,
        identity: Arc<dyn IdentityLookup>,
        registry: Arc<CommandRegistry>,
        handlers: HandlerTable,
    ) -> Self {
        let gate = AuthorizationGate::new(
            identity,
            Arc::clone(&backend),
            Arc::clone(&registry),
            config.chat.company_domain.clone(),
        );
        Self {
            gate,
            handlers: Arc::new(handlers),
            chat,
            backend,
            registry,
            settings: Arc::new(HandlerSettings::from_config(config)),
            fanout: FanOut::new(
                config.fanout.concurrency,
                Duration::from_secs(config.fanout.task_timeout_secs),
            ),
            deduper: EventDeduper::new(Duration::from_secs(config.dedup.window_secs)),
            clock: Arc::new(|| Utc::now().naive_utc()),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_fanout(mut self, fanout: FanOut) -> Self {
        self.fanout = fanout;
        self
    }

    fn enter(&self, state: DispatchState, trace_id: &str) {
        debug!(trace_id, state = state.as_str(), "Dispatch state change");
    }

    /// Run one inbound message to a terminal state. Every error below this
    /// point ends here and is rendered to the caller's placeholder.
    pub async fn dispatch(&self, event: &InboundEvent) -> DispatchOutcome {
        let trace_id = event.trace_id.as_str();
        if !self.deduper.check_and_mark(&event.event_id) {
            info!(trace_id, event_id = %event.event_id, "Dropping duplicate event");
            return DispatchOutcome::Duplicate;
        }

        self.enter(DispatchState::Received, trace_id);
        let handle = match self.chat.post_placeholder(&event.conversation_id).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(trace_id, error = %e, "Failed to post placeholder");
                return DispatchOutcome::Failed {
                    command: None,
                    error: e.to_string(),
                };
            }
        };

        let gate = self.gate.clone();
        let (caller_id, text) = (event.caller_id.clone(), event.text.clone());
        let gated = tokio::spawn(async move { gate.authorize(&caller_id, &text).await }).await;
        let authorized = match gated {
            Ok(Ok(authorized)) => authorized,
            Ok(Err(err)) => return self.reject(&handle, err, trace_id).await,
            Err(join_err) => {
                let message = join_failure(join_err);
                error!(trace_id, error = %message, "Authorization aborted");
                return self.fail(&handle, None, message, trace_id).await;
            }
        };
        let key = authorized.command.key;
        self.enter(DispatchState::Parsed, trace_id);
        self.enter(DispatchState::Authorized, trace_id);

        let Some(handler) = self.handlers.get(key) else {
            error!(trace_id, command = key, "No handler registered");
            let message = format!("no handler registered for '{}'", key);
            return self.fail(&handle, Some(key), message, trace_id).await;
        };

        let ctx = HandlerContext {
            backend: Arc::clone(&self.backend),
            fanout: self.fanout,
            settings: Arc::clone(&self.settings),
            registry: Arc::clone(&self.registry),
            now: (self.clock)(),
        };
        let args = authorized.command.args.clone();
        info!(
            trace_id,
            command = key,
            account = %authorized.context.account_name,
            "Executing command"
        );
        self.enter(DispatchState::Executing, trace_id);

        let joined = tokio::spawn(async move { handler.execute(&args, &ctx).await }).await;
        let reply = match joined {
            Ok(Ok(reply)) => reply,
            Ok(Err(err @ (CommandError::InvalidArguments { .. } | CommandError::EntityNotFound(_)))) => {
                info!(trace_id, command = key, error = %err, "Command rejected its arguments");
                Reply::text(err.to_string())
            }
            Ok(Err(err)) => {
                warn!(trace_id, command = key, error = %err, "Command failed");
                return self.fail(&handle, Some(key), err.to_string(), trace_id).await;
            }
            Err(join_err) => {
                let message = join_failure(join_err);
                error!(trace_id, command = key, error = %message, "Command aborted");
                return self.fail(&handle, Some(key), message, trace_id).await;
            }
        };

        match self.deliver(&handle, reply).await {
            Ok(messages) => {
                self.enter(DispatchState::Delivered, trace_id);
                info!(trace_id, command = key, messages, "Reply delivered");
                DispatchOutcome::Delivered {
                    command: key,
                    messages,
                }
            }
            Err(e) => {
                error!(trace_id, command = key, error = %e, "Delivery failed");
                DispatchOutcome::Failed {
                    command: Some(key),
                    error: e.to_string(),
                }
            }
        }
    }

    async fn reject(&self, handle: &MessageHandle, err: CommandError, trace_id: &str) -> DispatchOutcome {
        let notice = match &err {
            CommandError::UnknownCommand => UNKNOWN_COMMAND_NOTICE.to_string(),
            other => other.to_string(),
        };
        info!(trace_id, reason = %err, "Request rejected");
        for state in rejection_path(&err) {
            self.enter(*state, trace_id);
        }
        if let Err(e) = self.deliver(handle, Reply::text(notice)).await {
            error!(trace_id, error = %e, "Failed to deliver rejection");
        }
        DispatchOutcome::Rejected {
            reason: err.to_string(),
        }
    }

    async fn fail(
        &self,
        handle: &MessageHandle,
        key: Option<&'static str>,
        message: String,
        trace_id: &str,
    ) -> DispatchOutcome {
        self.enter(DispatchState::Failed, trace_id);
        let subject = key.unwrap_or("authorization");
        let reply = Reply::text(format!(
            "An error occurred for '{}':\n```\n{}\n```",
            subject, message
        ));
        if let Err(e) = self.deliver(handle, reply).await {
            error!(trace_id, command = subject, error = %e, "Failed to deliver error report");
        }
        DispatchOutcome::Failed {
            command: key,
            error: message,
        }
    }

    /// First message replaces the placeholder, the rest go to its thread.
    async fn deliver(&self, handle: &MessageHandle, reply: Reply) -> Result<usize, ChatError> {
        let messages = reply.into_messages(self.settings.max_message_chars);
        let mut messages_iter = messages.iter();
        if let Some(first) = messages_iter.next() {
            self.chat.update_message(handle, first).await?;
        }
        for message in messages_iter {
            self.chat.post_thread_reply(handle, message).await?;
        }
        Ok(messages.len())
    }
}

/// States a gate rejection passes through. Identity failures stop before the
/// text is parsed; everything else was parsed first.
fn rejection_path(err: &CommandError) -> &'static [DispatchState] {
    match err {
        CommandError::IdentityLookupFailed(_) | CommandError::BackendUnavailable(_) => {
            &[DispatchState::Rejected]
        }
        _ => &[DispatchState::Parsed, DispatchState::Rejected],
    }
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match detail {
        Some(detail) => format!("handler panicked: {}", detail),
        None => "handler panicked".to_string(),
    }
}
