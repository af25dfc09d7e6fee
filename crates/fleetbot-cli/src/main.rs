//! Fleetbot CLI
//!
//! Runs the Slack bot and offers offline checks of its config and command table

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetbot_config::Config;
use fleetbot_core::{parse, CommandError, CommandRegistry, FleetRuntime, HandlerTable};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "fleetbot")]
#[command(about = "Slack front end for Jamf Pro fleet administration", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (overrides the config file)
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot in the foreground
    Run,

    /// Validate the config and the command table
    Check,

    /// List every command with its usage and required permissions
    Commands,

    /// Show how a chat message would be parsed
    Parse {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let config = load_config(cli.config)?;
            let level = log_level(cli.log_level, &config);
            let log_dir = get_data_dir(&config).join("logs");
            let _logging_guard = logging::init_logging(&log_dir, &level)?;

            let runtime = FleetRuntime::new(config)?;
            info!("Starting fleetbot in foreground...");
            runtime.run().await?;
        }

        Commands::Check => {
            let config = load_config(cli.config)?;
            logging::init_stderr_logging(&log_level(cli.log_level, &config))?;
            let registry = CommandRegistry::builtin()?;
            let handlers = HandlerTable::builtin(&registry)?;

            println!("Config OK");
            println!("  backend:   {}", config.backend.base_url);
            println!(
                "  webhook:   {}{}",
                config.server.bind, config.server.events_path
            );
            println!(
                "  signing:   {}",
                if config.chat.signing_secret.is_some() {
                    "verified"
                } else {
                    "disabled"
                }
            );
            println!(
                "  fan-out:   {} workers, {}s per entity",
                config.fanout.concurrency, config.fanout.task_timeout_secs
            );
            println!("  dedup:     {}s window", config.dedup.window_secs);
            println!(
                "  channels:  {} allowed, {} denied",
                config.policy.allowed_channels.len(),
                config.policy.denied_channels.len()
            );
            println!(
                "Command table OK: {} commands, {} handlers",
                registry.len(),
                handlers.len()
            );
        }

        Commands::Commands => {
            let registry = CommandRegistry::builtin()?;
            for line in command_lines(&registry) {
                println!("{}", line);
            }
        }

        Commands::Parse { text } => {
            let registry = CommandRegistry::builtin()?;
            println!("{}", describe_parse(&registry, &text.join(" ")));
        }
    }

    Ok(())
}

fn load_config(config_path: Option<String>) -> Result<Config> {
    if let Some(path) = config_path {
        Config::load(&path).with_context(|| format!("failed to load config from {}", path))
    } else if let Some(default_path) = Config::default_path() {
        Config::load(&default_path)
            .with_context(|| format!("failed to load config from {}", default_path.display()))
    } else {
        anyhow::bail!("No config file found")
    }
}

fn log_level(flag: Option<String>, config: &Config) -> String {
    flag.or_else(|| config.core.log_level.clone())
        .unwrap_or_else(|| "info".to_string())
}

fn get_data_dir(config: &Config) -> PathBuf {
    if let Some(dir) = &config.core.data_dir {
        if let Some(rest) = dir.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("fleetbot"))
        .unwrap_or_else(|| PathBuf::from(".fleetbot"))
}

fn command_lines(registry: &CommandRegistry) -> Vec<String> {
    registry
        .iter()
        .map(|spec| {
            format!(
                "{:<16} {:<60} [{}]",
                spec.key,
                spec.usage,
                spec.permissions.join(" | ")
            )
        })
        .collect()
}

fn describe_parse(registry: &CommandRegistry, text: &str) -> String {
    match parse(registry, text) {
        Ok(parsed) => format!("key: {}\nargs: {:?}", parsed.key, parsed.args),
        Err(CommandError::UnknownCommand) => "no command matches this text".to_string(),
        Err(e) => format!("error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_subcommand_keeps_every_word() {
        let cli = Cli::try_parse_from(["fleetbot", "parse", "checkin", "alice-laptop", "-x"])
            .expect("parse");
        match cli.command {
            Commands::Parse { text } => assert_eq!(text, vec!["checkin", "alice-laptop", "-x"]),
            _ => panic!("expected parse"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["fleetbot", "check", "--config", "/tmp/f.toml", "-l", "debug"])
            .expect("parse");
        assert_eq!(cli.config.as_deref(), Some("/tmp/f.toml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn flag_beats_config_level() {
        let mut config = Config::default();
        config.core.log_level = Some("warn".to_string());
        assert_eq!(log_level(Some("trace".into()), &config), "trace");
        assert_eq!(log_level(None, &config), "warn");
        assert_eq!(log_level(None, &Config::default()), "info");
    }

    #[test]
    fn data_dir_from_config() {
        let mut config = Config::default();
        config.core.data_dir = Some("/var/lib/fleetbot".to_string());
        assert_eq!(get_data_dir(&config), PathBuf::from("/var/lib/fleetbot"));
    }

    #[test]
    fn describes_parse_results() {
        let registry = CommandRegistry::builtin().expect("registry");
        assert_eq!(
            describe_parse(&registry, "show script Install Rosetta"),
            "key: show_script\nargs: \"Install Rosetta\""
        );
        assert_eq!(
            describe_parse(&registry, "hello"),
            "no command matches this text"
        );
        assert!(describe_parse(&registry, "checkin").starts_with("error: No arguments provided"));
    }

    #[test]
    fn command_listing_covers_registry() {
        let registry = CommandRegistry::builtin().expect("registry");
        let lines = command_lines(&registry);
        assert_eq!(lines.len(), registry.len());
        assert!(lines.iter().any(|l| l.starts_with("devicelock") && l.contains("Update Computers")));
    }
}
