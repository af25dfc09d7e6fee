//! Script, extension attribute and distribution point listings.

use super::{usage_of, CommandHandler, HandlerContext};
use crate::error::{CommandError, OperationError};
use crate::aggregate::passthrough;
use crate::format::{code_block_chunks, pack, Reply};
use fleetbot_backend::ScriptRecord;
use std::sync::Arc;
use tracing::warn;

fn find_by_name<'a>(records: &'a [ScriptRecord], name: &str) -> Option<&'a ScriptRecord> {
    records
        .iter()
        .find(|r| r.name == name)
        .or_else(|| records.iter().find(|r| r.name.eq_ignore_ascii_case(name)))
}

/// `all` lists record names; anything else is looked up by name and its
/// contents shown fenced.
fn show_records(
    ctx: &HandlerContext,
    key: &str,
    what: &str,
    args: &str,
    records: Vec<ScriptRecord>,
) -> Result<Reply, CommandError> {
    let max = ctx.settings.max_message_chars;
    let name = args.trim();
    if name.is_empty() {
        return Err(CommandError::usage(usage_of(ctx, key)));
    }

    if name.eq_ignore_ascii_case("all") {
        if records.is_empty() {
            return Ok(Reply::text(format!("No {}s found.", what)));
        }
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        let mut pieces = vec![format!("*All {}s* ({}):", what, names.len())];
        pieces.extend(code_block_chunks(&names.join("\n"), max));
        return Ok(Reply::Chunks(pack(pieces, max)));
    }

    let record = find_by_name(&records, name)
        .ok_or_else(|| CommandError::EntityNotFound(format!("No {} named `{}` found.", what, name)))?;
    let mut pieces = vec![format!("`{}`:", record.name)];
    pieces.extend(code_block_chunks(&record.contents, max));
    Ok(Reply::Chunks(pack(pieces, max)))
}

pub struct ShowScript;

#[async_trait::async_trait]
impl CommandHandler for ShowScript {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let scripts = ctx.backend.scripts().await?;
        show_records(ctx, "show_script", "script", args, scripts)
    }
}

pub struct ExtensionAttributes;

#[async_trait::async_trait]
impl CommandHandler for ExtensionAttributes {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let attributes = ctx.backend.extension_attributes().await?;
        show_records(ctx, "extattr", "extension attribute", args, attributes)
    }
}

pub struct Files;

#[async_trait::async_trait]
impl CommandHandler for Files {
    async fn execute(&self, _args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let files = ctx.backend.files().await?;
        if files.is_empty() {
            return Ok(Reply::text("No files found on the distribution point."));
        }

        let targets: Vec<(usize, String)> = files.into_iter().enumerate().collect();
        let backend = Arc::clone(&ctx.backend);
        let report = ctx
            .fanout
            .run(targets, move |(index, name): (usize, String)| {
                let backend = Arc::clone(&backend);
                async move {
                    let link = backend.file_link(&name).await?;
                    Ok::<_, OperationError>((index, format!("<{}|{}>", link, name)))
                }
            })
            .await;
        for failure in &report.failures {
            warn!("No download link for '{}': {}", failure.entity.1, failure.error);
        }

        let mut links = report.successes;
        links.sort_by_key(|(index, _)| *index);
        let mut lines = vec!["*Distribution point files:*".to_string()];
        lines.extend(links.into_iter().map(|(_, line)| line));
        Ok(Reply::text(passthrough(&lines)))
    }
}
