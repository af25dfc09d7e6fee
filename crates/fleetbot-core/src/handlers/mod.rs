//! Command handlers and the table that maps registry keys onto them.

mod actions;
mod catalog;
mod groups;
mod inventory;

use crate::error::{CommandError, OperationError, RegistryError};
use crate::fanout::{FanOut, FanOutReport};
use crate::aggregate::passthrough;
use crate::format::Reply;
use crate::registry::CommandRegistry;
use chrono::NaiveDateTime;
use fleetbot_backend::{Entity, FleetBackend};
use fleetbot_config::Config;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tunables handlers read; fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub reserved_char: Option<char>,
    pub excluded_apps: Vec<String>,
    pub checkin_days: i64,
    pub reboot_days: i64,
    pub startup_attribute_id: String,
    pub appstore_top: usize,
    pub chart_top_apps: usize,
    pub max_message_chars: usize,
}

impl HandlerSettings {
    pub fn from_config(config: &Config) -> Self {
        let policy = &config.policy;
        Self {
            reserved_char: policy.reserved_char(),
            excluded_apps: policy.excluded_apps.clone(),
            checkin_days: policy.checkin_days,
            reboot_days: policy.reboot_days,
            startup_attribute_id: policy.startup_attribute_id.clone(),
            appstore_top: policy.appstore_top,
            chart_top_apps: policy.chart_top_apps,
            max_message_chars: config.chat.max_message_chars,
        }
    }
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Everything a handler may touch while running one command.
#[derive(Clone)]
pub struct HandlerContext {
    pub backend: Arc<dyn FleetBackend>,
    pub fanout: FanOut,
    pub settings: Arc<HandlerSettings>,
    pub registry: Arc<CommandRegistry>,
    /// Wall clock (UTC) at the start of the command.
    pub now: NaiveDateTime,
}

#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError>;
}

pub struct HandlerTable {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
}

impl HandlerTable {
    /// Build the table, requiring exactly one handler per registry key.
    pub fn new(
        registry: &CommandRegistry,
        handlers: Vec<(&'static str, Arc<dyn CommandHandler>)>,
    ) -> Result<Self, RegistryError> {
        let mut table = HashMap::new();
        for (key, handler) in handlers {
            if registry.get(key).is_none() {
                return Err(RegistryError::UnknownHandler(key.to_string()));
            }
            if table.insert(key, handler).is_some() {
                return Err(RegistryError::DuplicateKey(key.to_string()));
            }
        }
        if let Some(missing) = registry.keys().find(|key| !table.contains_key(key)) {
            return Err(RegistryError::MissingHandler(missing.to_string()));
        }
        Ok(Self { handlers: table })
    }

    pub fn builtin(registry: &CommandRegistry) -> Result<Self, RegistryError> {
        Self::new(registry, builtin_handlers())
    }

    /// Swap the handler for an already registered key.
    pub fn with_override(
        mut self,
        key: &'static str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Self, RegistryError> {
        match self.handlers.get_mut(key) {
            Some(slot) => {
                *slot = handler;
                Ok(self)
            }
            None => Err(RegistryError::UnknownHandler(key.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn entry(
    key: &'static str,
    handler: impl CommandHandler + 'static,
) -> (&'static str, Arc<dyn CommandHandler>) {
    (key, Arc::new(handler))
}

fn builtin_handlers() -> Vec<(&'static str, Arc<dyn CommandHandler>)> {
    vec![
        entry("help", Help),
        entry("commands", Commands),
        entry("appstore", inventory::AppStore),
        entry("checkin", inventory::CheckInStatus),
        entry("details", inventory::Details),
        entry("duplicates", inventory::Duplicates),
        entry("count_computers", inventory::CountComputers),
        entry("lockpass", inventory::LockPassword),
        entry("log", inventory::PolicyLogs),
        entry("mdmexpiry", inventory::MdmExpiry),
        entry("mdmcommands", inventory::MdmCommands),
        entry("membership", inventory::Membership),
        entry("reboots", inventory::Reboots),
        entry("recovery", inventory::RecoveryKey),
        entry("devicelock", actions::DeviceLock),
        entry("flush", actions::Flush),
        entry("redeploy", actions::Redeploy),
        entry("count_group", groups::CountGroup),
        entry("create_group", groups::CreateGroup),
        entry("chart", groups::Chart),
        entry("extattr", catalog::ExtensionAttributes),
        entry("files", catalog::Files),
        entry("show_script", catalog::ShowScript),
    ]
}

fn display_key(key: &str) -> String {
    key.replace('_', " ")
}

struct Help;

#[async_trait::async_trait]
impl CommandHandler for Help {
    async fn execute(&self, _args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let lines: Vec<String> = ctx
            .registry
            .iter()
            .map(|c| format!("`{}`: {}", display_key(c.key), c.description))
            .collect();
        Ok(Reply::text(format!(
            "`Commands and description`:\n{}",
            passthrough(&lines)
        )))
    }
}

struct Commands;

#[async_trait::async_trait]
impl CommandHandler for Commands {
    async fn execute(&self, _args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let lines: Vec<String> = ctx
            .registry
            .iter()
            .map(|c| format!("`{}`: {}", display_key(c.key), c.usage))
            .collect();
        Ok(Reply::text(format!("`Available commands`:\n{}", passthrough(&lines))))
    }
}

/// Usage line for `key`, for argument errors.
pub(crate) fn usage_of(ctx: &HandlerContext, key: &str) -> String {
    ctx.registry
        .get(key)
        .map(|c| c.usage.to_string())
        .unwrap_or_else(|| key.to_string())
}

/// Fleet listing minus synthetic records.
pub(crate) async fn fleet(ctx: &HandlerContext) -> Result<Vec<Entity>, CommandError> {
    let reserved = ctx.settings.reserved_char;
    let all = ctx.backend.list_entities().await?;
    let total = all.len();
    let fleet: Vec<Entity> = all.into_iter().filter(|e| !e.is_synthetic(reserved)).collect();
    debug!("Fleet listing: {} records, {} after synthetic filter", total, fleet.len());
    Ok(fleet)
}

/// Run `op` over the whole fleet. Failed entities are logged and dropped.
pub(crate) async fn fleet_fanout<R, F, Fut>(
    ctx: &HandlerContext,
    op: F,
) -> Result<FanOutReport<Entity, R>, CommandError>
where
    R: Send + 'static,
    F: Fn(Arc<dyn FleetBackend>, Entity) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, OperationError>> + Send + 'static,
{
    let entities = fleet(ctx).await?;
    let backend = Arc::clone(&ctx.backend);
    let report = ctx
        .fanout
        .run(entities, move |entity| op(Arc::clone(&backend), entity))
        .await;
    if report.is_partial() {
        warn!(
            "Partial fleet failure: {} of {} entities failed and were left out",
            report.failures.len(),
            report.total()
        );
    }
    Ok(report)
}

/// One named device on a per-device command.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub index: usize,
    pub name: String,
    pub id: u64,
}

#[derive(Debug)]
pub(crate) enum DeviceOutcome<R> {
    Found(R),
    NotFound,
    Failed(String),
}

pub(crate) fn split_names(args: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    args.split_whitespace()
        .filter(|name| seen.insert(name.to_string()))
        .map(str::to_string)
        .collect()
}

/// Resolve names against the listing: exact match first, then ignoring case.
fn resolve<'a>(listing: &'a [Entity], name: &str) -> Option<&'a Entity> {
    listing
        .iter()
        .find(|e| e.name == name)
        .or_else(|| listing.iter().find(|e| e.name.eq_ignore_ascii_case(name)))
}

/// Run `op` for every named device, returning one outcome per name in the
/// order the names were given.
pub(crate) async fn per_device<R, F, Fut>(
    ctx: &HandlerContext,
    names: &[String],
    op: F,
) -> Result<Vec<(String, DeviceOutcome<R>)>, CommandError>
where
    R: Send + 'static,
    F: Fn(Arc<dyn FleetBackend>, Target) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, OperationError>> + Send + 'static,
{
    let listing = ctx.backend.list_entities().await?;
    let mut outcomes: Vec<(String, Option<DeviceOutcome<R>>)> = Vec::with_capacity(names.len());
    let mut targets = Vec::new();
    for (index, name) in names.iter().enumerate() {
        match resolve(&listing, name) {
            Some(entity) => {
                targets.push(Target {
                    index,
                    name: name.clone(),
                    id: entity.id,
                });
                outcomes.push((name.clone(), None));
            }
            None => outcomes.push((name.clone(), Some(DeviceOutcome::NotFound))),
        }
    }

    let backend = Arc::clone(&ctx.backend);
    let report = ctx
        .fanout
        .run(targets, move |target: Target| {
            let index = target.index;
            let fut = op(Arc::clone(&backend), target);
            async move { fut.await.map(|r| (index, r)) }
        })
        .await;

    for (index, result) in report.successes {
        outcomes[index].1 = Some(DeviceOutcome::Found(result));
    }
    for failure in report.failures {
        outcomes[failure.entity.index].1 = Some(DeviceOutcome::Failed(failure.error.to_string()));
    }

    Ok(outcomes
        .into_iter()
        .map(|(name, outcome)| {
            let outcome = outcome.unwrap_or_else(|| DeviceOutcome::Failed("no result".to_string()));
            (name, outcome)
        })
        .collect())
}

/// Standard line for a device that produced no result.
pub(crate) fn missing_line(name: &str, outcome: &DeviceOutcome<impl Sized>) -> Option<String> {
    match outcome {
        DeviceOutcome::Found(_) => None,
        DeviceOutcome::NotFound => Some(format!("Computer `{}` not found.", name)),
        DeviceOutcome::Failed(reason) => Some(format!("Failed to fetch `{}`: {}", name, reason)),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::testing::MockBackend;
    use chrono::NaiveDate;
    use std::time::Duration;

    pub fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .expect("valid date")
    }

    pub fn days_ago(days: i64) -> NaiveDateTime {
        now() - chrono::Duration::days(days)
    }

    pub fn context(backend: MockBackend) -> HandlerContext {
        HandlerContext {
            backend: Arc::new(backend),
            fanout: FanOut::new(4, Duration::from_secs(5)),
            settings: Arc::new(HandlerSettings::default()),
            registry: Arc::new(CommandRegistry::builtin().expect("registry")),
            now: now(),
        }
    }

    pub fn text(reply: Reply) -> String {
        match reply {
            Reply::Text(text) => text,
            Reply::Chunks(chunks) => chunks.join("\n"),
            Reply::Blocks(blocks) => panic!("expected text, got blocks: {:?}", blocks),
        }
    }
}
