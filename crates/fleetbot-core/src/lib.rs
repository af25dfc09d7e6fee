//! Fleetbot Core
//!
//! Command dispatch, authorization and fleet fan-out for the chat front end

pub mod aggregate;
pub mod auth;
pub mod chart;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod format;
pub mod handlers;
pub mod parser;
pub mod registry;

#[cfg(test)]
mod testing;

pub use auth::{AuthorizationGate, AuthorizedCommand};
pub use dispatch::{DispatchOutcome, DispatchState, Dispatcher};
pub use error::{CommandError, OperationError, RegistryError, TaskError};
pub use fanout::{FanOut, FanOutReport};
pub use format::Reply;
pub use handlers::{CommandHandler, HandlerContext, HandlerSettings, HandlerTable};
pub use parser::{parse, ParsedCommand};
pub use registry::{CommandRegistry, CommandSpec};

use anyhow::{anyhow, Result};
use fleetbot_backend::{FleetBackend, JamfClient};
use fleetbot_config::Config;
use fleetbot_ipc::{EventBus, InboundEvent};
use fleetbot_policy::ChannelPolicy;
use fleetbot_slack::{serve, SlackClient, WebhookState};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

const MAX_INBOUND_CONCURRENCY: usize = 8;

pub struct FleetRuntime {
    config: Config,
    backend: Arc<JamfClient>,
    event_bus: EventBus,
    channel_policy: ChannelPolicy,
    dispatcher: Arc<Dispatcher>,
}

impl FleetRuntime {
    pub fn new(config: Config) -> Result<Self> {
        let backend = Arc::new(JamfClient::new(&config.backend)?);
        let slack = Arc::new(SlackClient::new(&config.chat)?);
        let registry = Arc::new(CommandRegistry::builtin()?);
        let handlers = HandlerTable::builtin(&registry)?;
        info!(
            "Command table ready: {} commands, {} handlers",
            registry.len(),
            handlers.len()
        );

        let dispatcher = Dispatcher::new(
            &config,
            Arc::clone(&backend) as Arc<dyn FleetBackend>,
            Arc::clone(&slack) as _,
            slack,
            registry,
            handlers,
        );

        Ok(Self {
            channel_policy: ChannelPolicy::new(Some(&config.policy)),
            config,
            backend,
            event_bus: EventBus::new(),
            dispatcher: Arc::new(dispatcher),
        })
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub async fn run(&self) -> Result<()> {
        info!("Fleetbot runtime starting...");

        self.backend
            .init()
            .await
            .map_err(|e| anyhow!("backend authentication failed: {}", e))?;

        let mut inbound_rx = self.event_bus.subscribe();
        let state = WebhookState::new(
            self.config.chat.signing_secret.clone(),
            self.event_bus.clone(),
        );
        let bind = self.config.server.bind.clone();
        let events_path = self.config.server.events_path.clone();
        let mut server = tokio::spawn(async move { serve(&bind, &events_path, state).await });

        let inbound_semaphore = Arc::new(Semaphore::new(MAX_INBOUND_CONCURRENCY));

        loop {
            tokio::select! {
                result = inbound_rx.recv() => {
                    match result {
                        Ok(event) => self.spawn_dispatch(event, &inbound_semaphore),
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Event bus closed, stopping dispatcher");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Event bus lagged by {} messages", n);
                        }
                    }
                }
                joined = &mut server => {
                    return match joined {
                        Ok(Ok(())) => Err(anyhow!("webhook server stopped")),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(anyhow!("webhook server task failed: {}", e)),
                    };
                }
            }
        }

        server.abort();
        Ok(())
    }

    fn spawn_dispatch(&self, event: InboundEvent, semaphore: &Arc<Semaphore>) {
        if !self.channel_policy.is_allowed(&event.conversation_id) {
            info!(
                trace_id = %event.trace_id,
                conversation = %event.conversation_id,
                "Dropping message from disallowed conversation"
            );
            return;
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let semaphore = Arc::clone(semaphore);
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    error!(trace_id = %event.trace_id, error = %err, "Inbound worker semaphore closed");
                    return;
                }
            };

            let outcome = dispatcher.dispatch(&event).await;
            debug!(trace_id = %event.trace_id, outcome = ?outcome, "Dispatch finished");
        });
    }
}
