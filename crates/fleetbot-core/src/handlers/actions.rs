//! Commands that change device state through MDM.

use super::{missing_line, per_device, split_names, usage_of, CommandHandler, DeviceOutcome, HandlerContext};
use crate::error::{CommandError, OperationError};
use crate::aggregate::passthrough;
use crate::format::Reply;
use tracing::info;

const PASSCODE_LEN: usize = 6;

fn is_passcode(raw: &str) -> bool {
    raw.len() == PASSCODE_LEN && raw.chars().all(|c| c.is_ascii_digit())
}

fn render<R>(outcomes: &[(String, DeviceOutcome<R>)], done: impl Fn(&str, &R) -> String) -> Reply {
    let lines: Vec<String> = outcomes
        .iter()
        .map(|(name, outcome)| match outcome {
            DeviceOutcome::Found(result) => done(name, result),
            other => missing_line(name, other).unwrap_or_default(),
        })
        .collect();
    Reply::text(passthrough(&lines))
}

pub struct DeviceLock;

#[async_trait::async_trait]
impl CommandHandler for DeviceLock {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let parts: Vec<&str> = args.split_whitespace().collect();
        let [computer, passcode] = parts.as_slice() else {
            return Err(CommandError::invalid(
                usage_of(ctx, "devicelock"),
                "a computer name and a passcode are required",
            ));
        };
        if !is_passcode(passcode) {
            return Err(CommandError::invalid(
                usage_of(ctx, "devicelock"),
                format!("the passcode must be {} digits", PASSCODE_LEN),
            ));
        }

        let passcode = passcode.to_string();
        let outcomes = per_device(ctx, &[computer.to_string()], move |backend, target| {
            let passcode = passcode.clone();
            async move {
                backend.device_lock(target.id, &passcode).await?;
                info!("Device lock sent to {} (id={})", target.name, target.id);
                Ok::<_, OperationError>(())
            }
        })
        .await?;
        Ok(render(&outcomes, |name, _| format!("Device lock sent to `{}`.", name)))
    }
}

pub struct Redeploy;

#[async_trait::async_trait]
impl CommandHandler for Redeploy {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let names = split_names(args);
        let outcomes = per_device(ctx, &names, |backend, target| async move {
            let command = backend.redeploy_framework(target.id).await?;
            info!("Redeploy queued for {} (command={})", target.name, command);
            Ok::<_, OperationError>(command)
        })
        .await?;
        Ok(render(&outcomes, |name, command| {
            format!("Redeployed `{}` (management command `{}`).", name, command)
        }))
    }
}

pub struct Flush;

#[async_trait::async_trait]
impl CommandHandler for Flush {
    async fn execute(&self, args: &str, ctx: &HandlerContext) -> Result<Reply, CommandError> {
        let names = split_names(args);
        let outcomes = per_device(ctx, &names, |backend, target| async move {
            backend.flush_commands(target.id).await?;
            Ok::<_, OperationError>(())
        })
        .await?;
        Ok(render(&outcomes, |name, _| {
            format!("Flushed pending and failed MDM commands for `{}`.", name)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, text};
    use super::*;
    use crate::testing::MockBackend;

    #[tokio::test]
    async fn devicelock_validates_passcode() {
        let backend = MockBackend::new().with_entity(3, "lost-mbp");
        let ctx = context(backend.clone());
        for args in ["lost-mbp", "lost-mbp 12345", "lost-mbp 12a456", "lost-mbp 123456 extra"] {
            let err = DeviceLock.execute(args, &ctx).await.expect_err(args);
            assert!(matches!(err, CommandError::InvalidArguments { .. }), "{}", args);
        }
        assert!(backend.actions().is_empty());

        let out = text(DeviceLock.execute("lost-mbp 480213", &ctx).await.expect("lock"));
        assert_eq!(out, "Device lock sent to `lost-mbp`.");
        assert_eq!(backend.actions(), vec!["lock:3:480213"]);
    }

    #[tokio::test]
    async fn redeploy_every_named_computer() {
        let backend = MockBackend::new().with_entity(1, "a-mbp").with_entity(2, "b-mbp");
        let ctx = context(backend.clone());
        let out = text(Redeploy.execute("a-mbp b-mbp c-mbp", &ctx).await.expect("redeploy"));
        assert_eq!(
            out,
            "Redeployed `a-mbp` (management command `cmd-1`).\nRedeployed `b-mbp` (management command `cmd-2`).\nComputer `c-mbp` not found."
        );
        let mut actions = backend.actions();
        actions.sort();
        assert_eq!(actions, vec!["redeploy:1", "redeploy:2"]);
    }

    #[tokio::test]
    async fn flush_reports_backend_failure_per_device() {
        let backend = MockBackend::new()
            .with_entity(1, "a-mbp")
            .with_entity(2, "b-mbp")
            .with_unavailable(2);
        let ctx = context(backend.clone());
        let out = text(Flush.execute("a-mbp b-mbp", &ctx).await.expect("flush"));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "Flushed pending and failed MDM commands for `a-mbp`.");
        assert!(lines[1].starts_with("Failed to fetch `b-mbp`: "));
        assert_eq!(backend.actions(), vec!["flush:1"]);
    }
}
