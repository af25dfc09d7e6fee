//! Smart and static group commands, and the comparison chart.

use super::inventory::installed_app_names;
use super::{fleet_fanout, usage_of, CommandHandler, HandlerContext};
use crate::aggregate::rank_by_frequency;
use crate::chart::{chart_url, ChartKind};
use crate::error::{CommandError, OperationError};
use crate::format::Reply;
use fleetbot_backend::{BackendError, Conjunction};
use fleetbot_slack::Block;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Criterion used when `count group` has to create the group itself.
const DEFAULT_CRITERION: &str = "Operating System Version";
const MIN_CHART_GROUPS: usize = 2;
const MAX_CHART_GROUPS: usize = 6;

pub struct CountGroup;

#[async_trait::async_trait]
impl CommandHandler for CountGroup {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let words: Vec<&str> = args.split_whitespace().collect();
        let Some((flag, group_words)) = words.split_last().filter(|(_, rest)| !rest.is_empty())
        else {
            return Err(CommandError::usage(usage_of(ctx, "count_group")));
        };
        let create = match flag.to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => {
                return Err(CommandError::invalid(
                    usage_of(ctx, "count_group"),
                    "the last argument must be true or false",
                ))
            }
        };
        let group = group_words.join(" ");

        match ctx.backend.group_member_count(&group).await {
            Ok(count) => Ok(Reply::text(format!("The group `{}` has {} computers.", group, count))),
            Err(BackendError::GroupNotFound(_)) if create => {
                ctx.backend
                    .create_smart_group(&group, DEFAULT_CRITERION, Conjunction::And)
                    .await?;
                info!("Created smart group '{}' on count request", group);
                let count = ctx.backend.group_member_count(&group).await?;
                Ok(Reply::text(format!(
                    "Created smart group `{}`. The group `{}` has {} computers.",
                    group, group, count
                )))
            }
            Err(BackendError::GroupNotFound(_)) => Ok(Reply::text(format!(
                "Could not find a smart group named `{}`. Pass `true` to create it, or use the `create group` command.",
                group
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

/// `"name" "criterion" ["and|or"] ["serial ..."]`, quoted parts only.
fn quoted_parts(args: &str) -> Vec<String> {
    args.split('"')
        .skip(1)
        .step_by(2)
        .map(|part| part.trim().to_string())
        .collect()
}

pub struct CreateGroup;

#[async_trait::async_trait]
impl CommandHandler for CreateGroup {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let parts = quoted_parts(args);
        let (Some(group), Some(criterion)) = (parts.first(), parts.get(1)) else {
            return Err(CommandError::invalid(
                usage_of(ctx, "create_group"),
                "the group name and criterion must be quoted",
            ));
        };
        if group.is_empty() {
            return Err(CommandError::invalid(
                usage_of(ctx, "create_group"),
                "the group name is empty",
            ));
        }

        let (conjunction, serial_part) = match parts.get(2).map(|p| p.to_ascii_lowercase()) {
            Some(word) if word == "and" => (Conjunction::And, parts.get(3)),
            Some(word) if word == "or" => (Conjunction::Or, parts.get(3)),
            _ => (Conjunction::And, parts.get(2)),
        };
        let serials: Vec<String> = serial_part
            .map(|p| p.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        if !serials.is_empty() {
            ctx.backend.create_static_group(group, &serials).await?;
            info!("Created static group '{}' with {} serials", group, serials.len());
            return Ok(Reply::text(format!(
                "Static group `{}` has been created with {} computers.",
                group,
                serials.len()
            )));
        }

        if criterion.is_empty() {
            return Err(CommandError::invalid(
                usage_of(ctx, "create_group"),
                "a smart group needs a criterion",
            ));
        }
        ctx.backend
            .create_smart_group(group, criterion, conjunction)
            .await?;
        info!("Created smart group '{}' ({} {})", group, criterion, conjunction.as_str());
        Ok(Reply::text(format!(
            "Smart group `{}` for `{}` has been created.",
            group, criterion
        )))
    }
}

/// Fleet-wide attribute a bar chart can rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChartAttribute {
    Model,
    Processor,
    Arch,
    Apps,
}

impl ChartAttribute {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "model" => Some(Self::Model),
            "processor" => Some(Self::Processor),
            "arch" => Some(Self::Arch),
            "apps" => Some(Self::Apps),
            _ => None,
        }
    }

    fn hardware_field(self) -> Option<&'static str> {
        match self {
            Self::Model => Some("model"),
            Self::Processor => Some("processorType"),
            Self::Arch => Some("processorArchitecture"),
            Self::Apps => None,
        }
    }

    fn title(self) -> &'static str {
        match self {
            Self::Model => "Model comparison on request",
            Self::Processor => "Processor comparison on request",
            Self::Arch => "Architecture comparison on request",
            Self::Apps => "Appstore apps comparison on request",
        }
    }
}

async fn hardware_values(ctx: &HandlerContext, field: &'static str) -> Result<Vec<String>, CommandError> {
    let report = fleet_fanout(ctx, move |backend, entity| async move {
        let hardware = backend.entity_detail(entity.id, "hardware").await?;
        Ok::<_, OperationError>(
            hardware
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string),
        )
    })
    .await?;
    Ok(report
        .successes
        .into_iter()
        .flatten()
        .filter(|value| !value.is_empty())
        .collect())
}

fn image_reply(
    kind: ChartKind,
    labels: &[String],
    counts: &[usize],
    title: &str,
) -> Result<Vec<Block>, CommandError> {
    let url = chart_url(kind, labels, counts, title)
        .map_err(|e| CommandError::Handler(format!("failed to build chart url: {}", e)))?;
    Ok(vec![Block::image(url.to_string(), title)])
}

async fn attribute_chart(ctx: &HandlerContext, attribute: ChartAttribute) -> Result<Reply, CommandError> {
    let ranked = match attribute.hardware_field() {
        Some(field) => rank_by_frequency(hardware_values(ctx, field).await?, usize::MAX),
        None => rank_by_frequency(installed_app_names(ctx).await?, ctx.settings.chart_top_apps),
    };
    if ranked.is_empty() {
        return Ok(Reply::text("No data available to chart."));
    }
    let (labels, counts): (Vec<String>, Vec<usize>) = ranked.into_iter().unzip();
    let blocks = image_reply(ChartKind::HorizontalBar, &labels, &counts, attribute.title())?;
    Ok(Reply::Blocks(blocks))
}

async fn group_chart(ctx: &HandlerContext, kind: ChartKind, groups: &[&str]) -> Result<Reply, CommandError> {
    let targets: Vec<(usize, String)> = groups
        .iter()
        .enumerate()
        .map(|(index, group)| (index, group.to_string()))
        .collect();
    let backend = Arc::clone(&ctx.backend);
    let report = ctx
        .fanout
        .run(targets, move |(index, group): (usize, String)| {
            let backend = Arc::clone(&backend);
            async move {
                let count = backend.group_member_count(&group).await?;
                Ok::<_, OperationError>((index, count))
            }
        })
        .await;

    let mut counted = report.successes;
    counted.sort_by_key(|(index, _)| *index);
    let mut skipped: Vec<(usize, String)> = report
        .failures
        .into_iter()
        .map(|failure| {
            warn!("Skipping group '{}' in chart: {}", failure.entity.1, failure.error);
            failure.entity
        })
        .collect();
    skipped.sort();

    if counted.is_empty() {
        return Err(CommandError::EntityNotFound(format!(
            "None of the requested groups could be counted: {}",
            groups.join(", ")
        )));
    }

    let labels: Vec<String> = counted.iter().map(|(index, _)| groups[*index].to_string()).collect();
    let counts: Vec<usize> = counted.iter().map(|(_, count)| *count).collect();
    let mut blocks = image_reply(kind, &labels, &counts, "Group comparison on request")?;
    if !skipped.is_empty() {
        let names: Vec<String> = skipped.iter().map(|(_, name)| format!("`{}`", name)).collect();
        blocks.push(Block::markdown(format!(
            "Could not count: {}",
            names.join(", ")
        )));
    }
    Ok(Reply::Blocks(blocks))
}

pub struct Chart;

#[async_trait::async_trait]
impl CommandHandler for Chart {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let words: Vec<&str> = args.split_whitespace().collect();
        let Some((raw_kind, rest)) = words.split_first() else {
            return Err(CommandError::usage(usage_of(ctx, "chart")));
        };
        let Some(kind) = ChartKind::parse(raw_kind) else {
            return Err(CommandError::invalid(
                usage_of(ctx, "chart"),
                format!("Invalid chart type `{}`. Use pie, bar or doughnut.", raw_kind),
            ));
        };

        if kind == ChartKind::Bar {
            if let [single] = rest {
                if let Some(attribute) = ChartAttribute::parse(single) {
                    return attribute_chart(ctx, attribute).await;
                }
            }
        }

        if !(MIN_CHART_GROUPS..=MAX_CHART_GROUPS).contains(&rest.len()) {
            return Err(CommandError::invalid(
                usage_of(ctx, "chart"),
                format!(
                    "between {} and {} groups are required",
                    MIN_CHART_GROUPS, MAX_CHART_GROUPS
                ),
            ));
        }
        group_chart(ctx, kind, rest).await
    }
}
