//! Read-only inventory commands, fleet-wide and per device.

use super::{
    fleet, fleet_fanout, missing_line, per_device, split_names, usage_of, CommandHandler,
    DeviceOutcome, HandlerContext,
};
use crate::aggregate::{
    count_matching, distinct_count, passthrough, rank_by_frequency, render_threshold_lines,
    threshold_filter,
};
use crate::error::{CommandError, OperationError};
use crate::format::{code_block_chunks, pack, Reply};
use chrono::NaiveDateTime;
use fleetbot_backend::{parse_timestamp, AppRecord, CommandHistory, Entity, GeneralRecord, MdmCommand};
use fleetbot_slack::Block;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const ADE_ALIAS: (&str, &str) = ("ade", "enrolledViaAutomatedDeviceEnrollment");
const COMPLETED_COMMANDS_SHOWN: usize = 5;

fn wants_all(args: &str) -> bool {
    args.split_whitespace()
        .next()
        .is_some_and(|w| w.eq_ignore_ascii_case("all"))
}

fn fmt_ts(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn fmt_opt_ts(ts: Option<NaiveDateTime>) -> String {
    ts.map(fmt_ts).unwrap_or_else(|| "unknown".to_string())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `key: value` lines for an object, one line per element for an array.
pub(crate) fn render_bag(bag: &Value) -> String {
    match bag {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, render_value(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(map) => map
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, render_value(v)))
                    .collect::<Vec<_>>()
                    .join(", "),
                other => render_value(other),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => render_value(other),
    }
}

/// Operator input to a typed JSON value: `true`/`false` compare as booleans,
/// everything else as text.
pub(crate) fn typed_value(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("true") {
        Value::Bool(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Value::Bool(false)
    } else {
        Value::String(raw.to_string())
    }
}

/// An attribute matches when it equals the typed target or renders to the
/// raw text, so `"14.5"` and `14.5` both match `14.5`.
pub(crate) fn attribute_matches(found: &Value, target: &Value, raw: &str) -> bool {
    if found == target {
        return true;
    }
    match found {
        Value::String(s) => s == raw,
        Value::Number(n) => n.to_string() == raw,
        _ => false,
    }
}

fn attribute_key(key: &str) -> String {
    if key.eq_ignore_ascii_case(ADE_ALIAS.0) {
        ADE_ALIAS.1.to_string()
    } else {
        key.to_string()
    }
}

/// Last-startup timestamp from a hardware section's extension attributes.
pub(crate) fn startup_timestamp(hardware: &Value, definition_id: &str) -> Option<NaiveDateTime> {
    hardware
        .get("extensionAttributes")?
        .as_array()?
        .iter()
        .find(|attr| {
            attr.get("definitionId")
                .map(render_value)
                .is_some_and(|id| id == definition_id)
        })?
        .get("values")?
        .as_array()?
        .first()?
        .as_str()
        .and_then(parse_timestamp)
}

/// Installed App Store app names across the fleet, excluded apps removed.
pub(crate) async fn installed_app_names(ctx: &HandlerContext) -> Result<Vec<String>, CommandError> {
    let report = fleet_fanout(ctx, |backend, entity| async move {
        let history = backend.computer_history(entity.id).await?;
        Ok::<_, OperationError>(
            history
                .app_store
                .installed
                .into_iter()
                .map(|app| app.name)
                .collect::<Vec<_>>(),
        )
    })
    .await?;
    let excluded = &ctx.settings.excluded_apps;
    Ok(report
        .successes
        .into_iter()
        .flatten()
        .filter(|name| !name.is_empty() && !excluded.contains(name))
        .collect())
}

pub struct CheckInStatus;

#[async_trait::async_trait]
impl CommandHandler for CheckInStatus {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        if wants_all(args) {
            let days = ctx.settings.checkin_days;
            let report = fleet_fanout(ctx, |backend, entity| async move {
                let check_in = backend.last_check_in(entity.id).await?;
                if check_in.last_contact.is_none() {
                    debug!("No last contact time for {}", entity.name);
                }
                Ok::<_, OperationError>(check_in.last_contact.map(|ts| (entity.name, ts)))
            })
            .await?;

            let cutoff = ctx.now - chrono::Duration::days(days);
            let stale = threshold_filter(report.successes.into_iter().flatten().collect(), cutoff);
            if stale.is_empty() {
                return Ok(Reply::text(format!(
                    "All computers have checked in within the last {} days.",
                    days
                )));
            }
            let mut lines = vec![format!(
                "*Not checked in within the last {} days* ({}):",
                days,
                stale.len()
            )];
            lines.extend(render_threshold_lines(&stale));
            return Ok(Reply::text(passthrough(&lines)));
        }

        let names = split_names(args);
        let outcomes = per_device(ctx, &names, |backend, target| async move {
            let check_in = backend.last_check_in(target.id).await?;
            Ok::<_, OperationError>(check_in)
        })
        .await?;

        let lines: Vec<String> = outcomes
            .iter()
            .map(|(name, outcome)| match outcome {
                DeviceOutcome::Found(check_in) => format!(
                    "Check-in info: `{}`: `user`: {}: {}",
                    name,
                    check_in.user,
                    check_in
                        .last_contact
                        .map(fmt_ts)
                        .unwrap_or_else(|| "never".to_string())
                ),
                other => missing_line(name, other).unwrap_or_default(),
            })
            .collect();
        Ok(Reply::text(passthrough(&lines)))
    }
}

pub struct Details;

#[async_trait::async_trait]
impl CommandHandler for Details {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let (category, rest) = match args.trim().split_once(char::is_whitespace) {
            Some((category, rest)) => (category.to_string(), rest),
            None => ("".to_string(), ""),
        };
        let names = split_names(rest);
        if names.is_empty() {
            return Err(CommandError::invalid(
                usage_of(ctx, "details"),
                "a category and at least one computer name are required",
            ));
        }

        let wanted = category.clone();
        let outcomes = per_device(ctx, &names, move |backend, target| {
            let category = wanted.clone();
            async move {
                let bag = backend.entity_detail(target.id, &category).await?;
                Ok::<_, OperationError>(bag)
            }
        })
        .await?;

        let max = ctx.settings.max_message_chars;
        let mut pieces = vec![format!("Details for *{}*:", category)];
        for (name, outcome) in &outcomes {
            match outcome {
                DeviceOutcome::Found(bag) => {
                    pieces.push(format!("`{}`:", name));
                    pieces.extend(code_block_chunks(&render_bag(bag), max));
                }
                other => pieces.extend(missing_line(name, other)),
            }
        }
        Ok(Reply::Chunks(pack(pieces, max)))
    }
}

pub struct PolicyLogs;

#[async_trait::async_trait]
impl CommandHandler for PolicyLogs {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let names = split_names(args);
        let outcomes = per_device(ctx, &names, |backend, target| async move {
            let history = backend.computer_history(target.id).await?;
            Ok::<_, OperationError>(history.policy_logs)
        })
        .await?;

        let sections: Vec<String> = outcomes
            .iter()
            .map(|(name, outcome)| match outcome {
                DeviceOutcome::Found(logs) if logs.is_empty() => {
                    format!("No logs found for `{}`.", name)
                }
                DeviceOutcome::Found(logs) => {
                    let lines: Vec<String> = logs
                        .iter()
                        .map(|log| {
                            format!(
                                "{} *Date run*: {} *Status*: {}",
                                log.policy_name, log.completed, log.status
                            )
                        })
                        .collect();
                    format!("`{}`:\n{}", name, passthrough(&lines))
                }
                other => missing_line(name, other).unwrap_or_default(),
            })
            .collect();
        Ok(Reply::text(sections.join("\n\n")))
    }
}

pub struct Membership;

#[async_trait::async_trait]
impl CommandHandler for Membership {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let names = split_names(args);
        let outcomes = per_device(ctx, &names, |backend, target| async move {
            let memberships = backend.entity_detail(target.id, "groupMemberships").await?;
            let groups: Vec<String> = memberships
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|g| g.get("groupName").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok::<_, OperationError>(groups)
        })
        .await?;

        let max = ctx.settings.max_message_chars;
        let mut pieces = Vec::new();
        for (name, outcome) in &outcomes {
            match outcome {
                DeviceOutcome::Found(groups) if groups.is_empty() => {
                    pieces.push(format!("No group memberships found for `{}`.", name));
                }
                DeviceOutcome::Found(groups) => {
                    pieces.push(format!("Membership info for `{}`:", name));
                    pieces.extend(code_block_chunks(&groups.join("\n"), max));
                }
                other => pieces.extend(missing_line(name, other)),
            }
        }
        Ok(Reply::Chunks(pack(pieces, max)))
    }
}

fn app_lines(history: &fleetbot_backend::AppStoreHistory) -> Vec<String> {
    fn section(out: &mut Vec<String>, title: &str, apps: &[AppRecord], line: impl Fn(&AppRecord) -> String) {
        if apps.is_empty() {
            return;
        }
        if !out.is_empty() {
            out.push(String::new());
        }
        out.push(title.to_string());
        out.extend(apps.iter().map(line));
    }

    let mut out = Vec::new();
    section(&mut out, "*Installed Apps:*", &history.installed, |app| {
        format!("📥 `{}` (v{}, {} MB)", app.name, app.version, app.size_mb)
    });
    section(&mut out, "*Pending Apps:*", &history.pending, |app| {
        format!("🕒 `{}` (v{}) - Deployed: {}", app.name, app.version, app.deployed)
    });
    section(&mut out, "*Failed Apps:*", &history.failed, |app| {
        format!("❌ `{}` (v{}) - Status: {}", app.name, app.version, app.status)
    });
    out
}

pub struct AppStore;

#[async_trait::async_trait]
impl CommandHandler for AppStore {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        if wants_all(args) {
            let top = args
                .split_whitespace()
                .nth(1)
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(ctx.settings.appstore_top);

            let names = installed_app_names(ctx).await?;
            let ranked = rank_by_frequency(names.iter().cloned(), top);
            if ranked.is_empty() {
                return Ok(Reply::text("No installed apps data available."));
            }
            let mut lines = vec![format!("*Top {} Installed Apps:*", top)];
            lines.extend(ranked.iter().enumerate().map(|(i, (app, count))| {
                format!("{}. `{}`: Installed on `{}` computers", i + 1, app, count)
            }));
            lines.push(format!(
                "\n*Total unique apps installed*: `{}`\n*Excluding*: {}",
                distinct_count(names),
                ctx.settings.excluded_apps.join(", ")
            ));
            return Ok(Reply::text(passthrough(&lines)));
        }

        let names = split_names(args);
        let outcomes = per_device(ctx, &names, |backend, target| async move {
            let history = backend.computer_history(target.id).await?;
            Ok::<_, OperationError>(history.app_store)
        })
        .await?;

        let sections: Vec<String> = outcomes
            .iter()
            .map(|(name, outcome)| match outcome {
                DeviceOutcome::Found(apps) => {
                    let lines = app_lines(apps);
                    if lines.is_empty() {
                        format!("Appstore apps for `{}`:\nNo app store data available.", name)
                    } else {
                        format!("Appstore apps for `{}`:\n{}", name, passthrough(&lines))
                    }
                }
                other => missing_line(name, other).unwrap_or_default(),
            })
            .collect();
        Ok(Reply::text(sections.join("\n\n")))
    }
}

fn mdm_expiration(general: &Value) -> Option<NaiveDateTime> {
    general
        .get("mdmProfileExpiration")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
}

pub struct MdmExpiry;

#[async_trait::async_trait]
impl CommandHandler for MdmExpiry {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        if wants_all(args) {
            let report = fleet_fanout(ctx, |backend, entity| async move {
                let general = backend.entity_detail(entity.id, "general").await?;
                Ok::<_, OperationError>(mdm_expiration(&general).map(|ts| (entity.name, ts)))
            })
            .await?;

            let expired = threshold_filter(report.successes.into_iter().flatten().collect(), ctx.now);
            if expired.is_empty() {
                return Ok(Reply::text("No computers have an expired MDM profile."));
            }
            let mut lines = vec![format!("*Expired MDM profiles*: `{}`", expired.len())];
            lines.extend(render_threshold_lines(&expired));
            return Ok(Reply::text(passthrough(&lines)));
        }

        let names = split_names(args);
        let outcomes = per_device(ctx, &names, |backend, target| async move {
            let general = backend.entity_detail(target.id, "general").await?;
            Ok::<_, OperationError>(mdm_expiration(&general))
        })
        .await?;

        let lines: Vec<String> = outcomes
            .iter()
            .map(|(name, outcome)| match outcome {
                DeviceOutcome::Found(expiry) => {
                    format!("MDM expiry info for `{}`: {}", name, fmt_opt_ts(*expiry))
                }
                other => missing_line(name, other).unwrap_or_default(),
            })
            .collect();
        Ok(Reply::text(passthrough(&lines)))
    }
}

type CommandFields = fn(&MdmCommand) -> Vec<(&'static str, String)>;

fn command_blocks(name: &str, history: &CommandHistory) -> Vec<Block> {
    let skip = history.completed.len().saturating_sub(COMPLETED_COMMANDS_SHOWN);
    let completed: Vec<&MdmCommand> = history.completed.iter().skip(skip).collect();
    let pending: Vec<&MdmCommand> = history.pending.iter().collect();
    let failed: Vec<&MdmCommand> = history.failed.iter().collect();

    let sections: [(&str, Vec<&MdmCommand>, CommandFields); 3] = [
        ("Completed", completed, |c| {
            vec![("Command", c.name.clone()), ("Date", c.completed.clone())]
        }),
        ("Pending", pending, |c| {
            vec![
                ("Command", c.name.clone()),
                ("Date", c.issued.clone()),
                ("Last Push", c.last_push.clone()),
            ]
        }),
        ("Failed", failed, |c| {
            vec![
                ("Command", c.name.clone()),
                ("Status", c.status.clone()),
                ("Date", c.completed.clone()),
            ]
        }),
    ];

    let mut blocks = vec![Block::markdown(format!("*Commands history for `{}`:*", name))];
    for (title, commands, fields) in sections {
        blocks.push(Block::markdown(format!("*{}*", title)));
        blocks.push(Block::divider());
        if commands.is_empty() {
            blocks.push(Block::markdown("_None_"));
        }
        for command in commands {
            blocks.push(Block::fields(
                fields(command)
                    .into_iter()
                    .map(|(key, value)| format!("*{}:* `{}`", key, value)),
            ));
        }
    }
    blocks
}

pub struct MdmCommands;

#[async_trait::async_trait]
impl CommandHandler for MdmCommands {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let names = split_names(args);
        let outcomes = per_device(ctx, &names, |backend, target| async move {
            let history = backend.computer_history(target.id).await?;
            Ok::<_, OperationError>(history.commands)
        })
        .await?;

        let mut blocks = Vec::new();
        for (name, outcome) in &outcomes {
            match outcome {
                DeviceOutcome::Found(history) => blocks.extend(command_blocks(name, history)),
                other => blocks.extend(missing_line(name, other).map(Block::markdown)),
            }
        }
        Ok(Reply::Blocks(blocks))
    }
}

pub struct Reboots;

#[async_trait::async_trait]
impl CommandHandler for Reboots {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let attribute_id = ctx.settings.startup_attribute_id.clone();

        if wants_all(args) {
            let days = ctx.settings.reboot_days;
            let report = fleet_fanout(ctx, move |backend, entity| {
                let attribute_id = attribute_id.clone();
                async move {
                    let hardware = backend.entity_detail(entity.id, "hardware").await?;
                    Ok::<_, OperationError>(
                        startup_timestamp(&hardware, &attribute_id).map(|ts| (entity.name, ts)),
                    )
                }
            })
            .await?;

            let cutoff = ctx.now - chrono::Duration::days(days);
            let stale = threshold_filter(report.successes.into_iter().flatten().collect(), cutoff);
            if stale.is_empty() {
                return Ok(Reply::text(format!(
                    "All specified computers have started within the last {} days.",
                    days
                )));
            }
            return Ok(Reply::text(format!(
                "Reboot data:\n{}",
                render_threshold_lines(&stale).join("\n")
            )));
        }

        let names = split_names(args);
        let outcomes = per_device(ctx, &names, move |backend, target| {
            let attribute_id = attribute_id.clone();
            async move {
                let hardware = backend.entity_detail(target.id, "hardware").await?;
                Ok::<_, OperationError>(startup_timestamp(&hardware, &attribute_id))
            }
        })
        .await?;

        let lines: Vec<String> = outcomes
            .iter()
            .map(|(name, outcome)| match outcome {
                DeviceOutcome::Found(Some(ts)) => format!("`{}`: {}", name, fmt_ts(*ts)),
                DeviceOutcome::Found(None) => format!("No startup data found for `{}`.", name),
                other => missing_line(name, other).unwrap_or_default(),
            })
            .collect();
        Ok(Reply::text(format!("Reboot data:\n{}", passthrough(&lines))))
    }
}

pub struct RecoveryKey;

#[async_trait::async_trait]
impl CommandHandler for RecoveryKey {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let names = split_names(args);
        let outcomes = per_device(ctx, &names, |backend, target| async move {
            let key = backend.recovery_key(target.id).await?;
            Ok::<_, OperationError>(key)
        })
        .await?;

        let lines: Vec<String> = outcomes
            .iter()
            .map(|(name, outcome)| match outcome {
                DeviceOutcome::Found(Some(key)) => format!("Recovery key for `{}`: {}", name, key),
                DeviceOutcome::Found(None) => format!("No recovery key escrowed for `{}`.", name),
                other => missing_line(name, other).unwrap_or_default(),
            })
            .collect();
        Ok(Reply::text(passthrough(&lines)))
    }
}

pub struct LockPassword;

#[async_trait::async_trait]
impl CommandHandler for LockPassword {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let names = split_names(args);
        let outcomes = per_device(ctx, &names, |backend, target| async move {
            let password = backend.recovery_lock_password(target.id).await?;
            Ok::<_, OperationError>(password)
        })
        .await?;

        let lines: Vec<String> = outcomes
            .iter()
            .map(|(name, outcome)| match outcome {
                DeviceOutcome::Found(Some(password)) => {
                    format!("Recovery lock password for `{}`: `{}`", name, password)
                }
                DeviceOutcome::Found(None) => format!("No lock password found for `{}`.", name),
                other => missing_line(name, other).unwrap_or_default(),
            })
            .collect();
        Ok(Reply::text(passthrough(&lines)))
    }
}

fn record_text(title: &str, record: &GeneralRecord) -> String {
    format!(
        "*{}:*\nID: {}\nSerial No: {}\nName: {}\nLast Contact: {}\nEnrolled: {}",
        title,
        record.id,
        record.serial_number,
        record.name,
        fmt_opt_ts(record.last_contact),
        fmt_opt_ts(record.last_enrolled)
    )
}

pub struct Duplicates;

#[async_trait::async_trait]
impl CommandHandler for Duplicates {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        if !args.trim().is_empty() && !wants_all(args) {
            return Err(CommandError::usage(usage_of(ctx, "duplicates")));
        }

        let mut by_name: HashMap<String, Vec<Entity>> = HashMap::new();
        for entity in fleet(ctx).await? {
            by_name.entry(entity.name.clone()).or_default().push(entity);
        }
        let mut names: Vec<String> = by_name
            .iter()
            .filter(|(_, records)| records.len() > 1)
            .map(|(name, _)| name.clone())
            .collect();
        if names.is_empty() {
            return Ok(Reply::text("No duplicates found."));
        }
        names.sort();

        let entities: Vec<Entity> = names
            .iter()
            .filter_map(|name| by_name.remove(name))
            .flatten()
            .collect();
        let backend = Arc::clone(&ctx.backend);
        let report = ctx
            .fanout
            .run(entities, move |entity: Entity| {
                let backend = Arc::clone(&backend);
                async move {
                    let record = backend.general_record(entity.id).await?;
                    Ok::<_, OperationError>((entity.name, record))
                }
            })
            .await;
        if report.is_partial() {
            warn!(
                "{} duplicate records could not be fetched",
                report.failures.len()
            );
        }

        let mut records: HashMap<String, Vec<GeneralRecord>> = HashMap::new();
        for (name, record) in report.successes {
            records.entry(name).or_default().push(record);
        }

        let mut blocks = vec![Block::markdown("*Duplicates:*"), Block::divider()];
        for name in &names {
            let Some(group) = records.get_mut(name) else {
                continue;
            };
            if group.len() < 2 {
                debug!("Only {} record fetched for duplicate '{}'", group.len(), name);
                continue;
            }
            group.sort_by(|a, b| a.last_enrolled.cmp(&b.last_enrolled).then(a.id.cmp(&b.id)));
            if let (Some(oldest), Some(newest)) = (group.first(), group.last()) {
                blocks.push(Block::fields([
                    record_text("Oldest Record", oldest),
                    record_text("Newest Record", newest),
                ]));
            }
        }
        if blocks.len() == 2 {
            return Ok(Reply::text(
                "Duplicate names were found but their records could not be fetched.",
            ));
        }
        Ok(Reply::Blocks(blocks))
    }
}

pub struct CountComputers;

#[async_trait::async_trait]
impl CommandHandler for CountComputers {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let parts: Vec<&str> = args.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(CommandError::invalid(
                usage_of(ctx, "count_computers"),
                "a category, a key and a value are required",
            ));
        }
        let category = parts[0].to_string();
        let subset = parts[1].to_string();
        let raw_value = parts[2..].join(" ");
        let target = typed_value(&raw_value);

        let (wanted_category, key) = (category.clone(), attribute_key(&subset));
        let report = fleet_fanout(ctx, move |backend, entity| {
            let category = wanted_category.clone();
            let key = key.clone();
            async move {
                let bag = backend.entity_detail(entity.id, &category).await?;
                Ok::<_, OperationError>(bag.get(&key).cloned().unwrap_or(Value::Null))
            }
        })
        .await?;

        let matched: Vec<bool> = report
            .successes
            .iter()
            .map(|found| attribute_matches(found, &target, &raw_value))
            .collect();
        let count = count_matching(&matched, &true);
        Ok(Reply::text(format!(
            "Count of computers in `{}` for `{}` (value `{}`): {}",
            category, subset, raw_value, count
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, days_ago, text};
    use super::*;
    use crate::testing::MockBackend;
    use fleetbot_backend::{AppStoreHistory, ComputerHistory, PolicyLog};
    use serde_json::json;

    fn history_with_apps(apps: &[&str]) -> ComputerHistory {
        ComputerHistory {
            app_store: AppStoreHistory {
                installed: apps
                    .iter()
                    .map(|name| AppRecord {
                        name: name.to_string(),
                        version: "1.0".into(),
                        size_mb: "10".into(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn typed_values() {
        assert_eq!(typed_value("TRUE"), json!(true));
        assert_eq!(typed_value("14.5"), json!("14.5"));
        assert_eq!(typed_value("Sonoma"), json!("Sonoma"));
    }

    #[test]
    fn attribute_match_by_value_or_text() {
        let target = typed_value("14.5");
        assert!(attribute_matches(&json!("14.5"), &target, "14.5"));
        assert!(attribute_matches(&json!(14.5), &target, "14.5"));
        assert!(!attribute_matches(&json!("14.50"), &target, "14.5"));
        assert!(!attribute_matches(&Value::Null, &target, "14.5"));
        assert!(attribute_matches(&json!(true), &typed_value("True"), "True"));
        assert_eq!(attribute_key("ADE"), "enrolledViaAutomatedDeviceEnrollment");
    }

    #[test]
    fn startup_attribute_lookup() {
        let hardware = json!({
            "model": "MacBook Air",
            "extensionAttributes": [
                {"definitionId": "12", "values": ["x"]},
                {"definitionId": "29", "values": ["2024-04-01 09:30:00"]}
            ]
        });
        assert_eq!(startup_timestamp(&hardware, "29").map(fmt_ts), Some("2024-04-01 09:30:00".into()));
        assert_eq!(startup_timestamp(&hardware, "30"), None);
        assert_eq!(startup_timestamp(&json!({}), "29"), None);
    }

    #[tokio::test]
    async fn checkin_all_lists_stale_computers_by_name() {
        let backend = MockBackend::new()
            .with_entity(1, "zed-mbp")
            .with_check_in(1, "Zed", Some(days_ago(90)))
            .with_entity(2, "amy-mbp")
            .with_check_in(2, "Amy", Some(days_ago(41)))
            .with_entity(3, "bob-mbp")
            .with_check_in(3, "Bob", Some(days_ago(2)))
            .with_entity(4, "lab_template")
            .with_check_in(4, "", Some(days_ago(400)));
        let out = text(CheckInStatus.execute("all", &context(backend)).await.expect("checkin"));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "*Not checked in within the last 40 days* (2):");
        assert!(lines[1].starts_with("`amy-mbp`: "));
        assert!(lines[2].starts_with("`zed-mbp`: "));
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn checkin_all_fresh_fleet() {
        let backend = MockBackend::new()
            .with_entity(1, "bob-mbp")
            .with_check_in(1, "Bob", Some(days_ago(1)));
        let out = text(CheckInStatus.execute("all", &context(backend)).await.expect("checkin"));
        assert_eq!(out, "All computers have checked in within the last 40 days.");
    }

    #[tokio::test]
    async fn checkin_per_device() {
        let backend = MockBackend::new()
            .with_entity(1, "alice-laptop")
            .with_check_in(1, "Alice Example", Some(days_ago(3)));
        let out = text(
            CheckInStatus
                .execute("alice-laptop ghost", &context(backend))
                .await
                .expect("checkin"),
        );
        assert_eq!(
            out,
            "Check-in info: `alice-laptop`: `user`: Alice Example: 2024-05-29 12:00:00\nComputer `ghost` not found."
        );
    }

    #[tokio::test]
    async fn count_computers_counts_typed_matches() {
        let backend = MockBackend::new()
            .with_entity(1, "a")
            .with_detail(1, "general", json!({"enrolledViaAutomatedDeviceEnrollment": true}))
            .with_entity(2, "b")
            .with_detail(2, "general", json!({"enrolledViaAutomatedDeviceEnrollment": false}))
            .with_entity(3, "c")
            .with_detail(3, "general", json!({"enrolledViaAutomatedDeviceEnrollment": true}))
            .with_entity(4, "d")
            .with_unavailable(4);
        let out = text(
            CountComputers
                .execute("general ade true", &context(backend))
                .await
                .expect("count"),
        );
        assert_eq!(out, "Count of computers in `general` for `ade` (value `true`): 2");
    }

    #[tokio::test]
    async fn count_computers_matches_string_versions() {
        let backend = MockBackend::new()
            .with_entity(1, "a")
            .with_detail(1, "operatingSystem", json!({"version": "14.5"}))
            .with_entity(2, "b")
            .with_detail(2, "operatingSystem", json!({"version": "14.5"}))
            .with_entity(3, "c")
            .with_detail(3, "operatingSystem", json!({"version": "13.6.1"}));
        let out = text(
            CountComputers
                .execute("operatingSystem version 14.5", &context(backend))
                .await
                .expect("count"),
        );
        assert_eq!(
            out,
            "Count of computers in `operatingSystem` for `version` (value `14.5`): 2"
        );
    }

    #[tokio::test]
    async fn count_computers_needs_three_arguments() {
        let err = CountComputers
            .execute("general ade", &context(MockBackend::new()))
            .await
            .expect_err("usage");
        assert!(matches!(err, CommandError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn appstore_all_ranks_and_excludes() {
        let backend = MockBackend::new()
            .with_entity(1, "a")
            .with_history(1, history_with_apps(&["Xcode.app", "Slack.app", "Pages.app"]))
            .with_entity(2, "b")
            .with_history(2, history_with_apps(&["Slack.app"]))
            .with_entity(3, "c")
            .with_history(3, history_with_apps(&["Slack.app", "Xcode.app", "Things.app"]));
        let out = text(AppStore.execute("all 2", &context(backend)).await.expect("appstore"));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "*Top 2 Installed Apps:*");
        assert_eq!(lines[1], "1. `Slack.app`: Installed on `3` computers");
        assert_eq!(lines[2], "2. `Xcode.app`: Installed on `2` computers");
        assert!(out.contains("*Total unique apps installed*: `3`"));
        assert!(!out.contains("`Pages.app`:"));
    }

    #[tokio::test]
    async fn appstore_per_device_sections() {
        let mut history = history_with_apps(&["Xcode.app"]);
        history.app_store.failed.push(AppRecord {
            name: "Slack.app".into(),
            version: "4.0".into(),
            status: "Failed".into(),
            ..Default::default()
        });
        let backend = MockBackend::new().with_entity(7, "alice-mbp").with_history(7, history);
        let out = text(AppStore.execute("alice-mbp", &context(backend)).await.expect("appstore"));
        assert!(out.starts_with("Appstore apps for `alice-mbp`:\n*Installed Apps:*\n📥 `Xcode.app` (v1.0, 10 MB)"));
        assert!(out.contains("*Failed Apps:*\n❌ `Slack.app` (v4.0) - Status: Failed"));
        assert!(!out.contains("*Pending Apps:*"));
    }

    #[tokio::test]
    async fn policy_logs_per_device() {
        let history = ComputerHistory {
            policy_logs: vec![PolicyLog {
                policy_name: "Install Zoom".into(),
                completed: "2024-05-01 10:00:00".into(),
                status: "Completed".into(),
            }],
            ..Default::default()
        };
        let backend = MockBackend::new()
            .with_entity(1, "alice-mbp")
            .with_history(1, history)
            .with_entity(2, "bob-mbp");
        let out = text(PolicyLogs.execute("alice-mbp bob-mbp", &context(backend)).await.expect("log"));
        assert_eq!(
            out,
            "`alice-mbp`:\nInstall Zoom *Date run*: 2024-05-01 10:00:00 *Status*: Completed\n\nNo logs found for `bob-mbp`."
        );
    }

    #[tokio::test]
    async fn details_render_code_blocks() {
        let backend = MockBackend::new()
            .with_entity(1, "alice-mbp")
            .with_detail(1, "general", json!({"name": "alice-mbp", "supervised": true}));
        let out = text(Details.execute("General alice-mbp", &context(backend)).await.expect("details"));
        assert_eq!(
            out,
            "Details for *General*:\n`alice-mbp`:\n```name: alice-mbp\nsupervised: true```"
        );
    }

    #[tokio::test]
    async fn details_unknown_category_is_reported_per_device() {
        let backend = MockBackend::new().with_entity(1, "alice-mbp");
        let out = text(Details.execute("printers alice-mbp", &context(backend)).await.expect("details"));
        assert!(out.contains("Failed to fetch `alice-mbp`"));
        assert!(out.contains("printers"));
    }

    #[tokio::test]
    async fn membership_lists_group_names() {
        let backend = MockBackend::new().with_entity(1, "alice-mbp").with_detail(
            1,
            "groupMemberships",
            json!([{"groupId": "1", "groupName": "All Managed"}, {"groupId": "2", "groupName": "Sonoma"}]),
        );
        let out = text(Membership.execute("alice-mbp", &context(backend)).await.expect("membership"));
        assert_eq!(out, "Membership info for `alice-mbp`:\n```All Managed\nSonoma```");
    }

    #[tokio::test]
    async fn mdmexpiry_all_counts_expired() {
        let backend = MockBackend::new()
            .with_entity(1, "old-mbp")
            .with_detail(1, "general", json!({"mdmProfileExpiration": "2024-01-01T00:00:00Z"}))
            .with_entity(2, "new-mbp")
            .with_detail(2, "general", json!({"mdmProfileExpiration": "2026-01-01T00:00:00Z"}));
        let out = text(MdmExpiry.execute("all", &context(backend)).await.expect("expiry"));
        assert_eq!(out, "*Expired MDM profiles*: `1`\n`old-mbp`: 2024-01-01 00:00:00");
    }

    #[tokio::test]
    async fn reboots_all_uses_startup_attribute() {
        let hw = |ts: &str| json!({"extensionAttributes": [{"definitionId": "29", "values": [ts]}]});
        let backend = MockBackend::new()
            .with_entity(1, "uptime-mbp")
            .with_detail(1, "hardware", hw("2024-02-01 08:00:00"))
            .with_entity(2, "fresh-mbp")
            .with_detail(2, "hardware", hw("2024-05-30 08:00:00"));
        let out = text(Reboots.execute("all", &context(backend)).await.expect("reboots"));
        assert_eq!(out, "Reboot data:\n`uptime-mbp`: 2024-02-01 08:00:00");
    }

    #[tokio::test]
    async fn mdmcommands_blocks() {
        let mut history = ComputerHistory::default();
        for i in 0..7 {
            history.commands.completed.push(MdmCommand {
                name: format!("Cmd{}", i),
                completed: "2024-05-01".into(),
                ..Default::default()
            });
        }
        history.commands.failed.push(MdmCommand {
            name: "DeviceLock".into(),
            status: "Error".into(),
            ..Default::default()
        });
        let backend = MockBackend::new().with_entity(1, "alice-mbp").with_history(1, history);
        let reply = MdmCommands.execute("alice-mbp", &context(backend)).await.expect("mdm");
        let Reply::Blocks(blocks) = reply else {
            panic!("expected blocks");
        };
        let json = serde_json::to_string(&blocks).expect("json");
        assert!(json.contains("*Commands history for `alice-mbp`:*"));
        assert!(!json.contains("Cmd1"));
        assert!(json.contains("Cmd2") && json.contains("Cmd6"));
        assert!(json.contains("*Status:* `Error`"));
        assert!(json.contains("_None_"));
    }

    #[tokio::test]
    async fn duplicates_report_oldest_and_newest() {
        let record = |id: u64, serial: &str, enrolled: i64| GeneralRecord {
            id,
            name: "alice-mbp".into(),
            serial_number: serial.into(),
            last_contact: Some(days_ago(1)),
            last_enrolled: Some(days_ago(enrolled)),
        };
        let backend = MockBackend::new()
            .with_entity(1, "alice-mbp")
            .with_general(record(1, "OLD1", 300))
            .with_entity(2, "alice-mbp")
            .with_general(record(2, "NEW2", 10))
            .with_entity(3, "bob-mbp")
            .with_entity(4, "lab_x")
            .with_entity(5, "lab_x");
        let reply = Duplicates.execute("", &context(backend)).await.expect("duplicates");
        let Reply::Blocks(blocks) = reply else {
            panic!("expected blocks");
        };
        assert_eq!(blocks.len(), 3);
        let json = serde_json::to_string(&blocks[2]).expect("json");
        assert!(json.contains("*Oldest Record:*\\nID: 1\\nSerial No: OLD1"));
        assert!(json.contains("*Newest Record:*\\nID: 2\\nSerial No: NEW2"));
    }

    #[tokio::test]
    async fn no_duplicates() {
        let backend = MockBackend::new().with_entity(1, "a").with_entity(2, "b");
        let out = text(Duplicates.execute("all", &context(backend)).await.expect("duplicates"));
        assert_eq!(out, "No duplicates found.");
    }
}
