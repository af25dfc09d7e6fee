//! Command registry: keys, usage lines and required permissions.

use crate::error::RegistryError;
use std::collections::HashSet;

pub const READ_COMPUTERS: &str = "Read Computers";
pub const UPDATE_COMPUTERS: &str = "Update Computers";
pub const READ_SMART_GROUPS: &str = "Read Smart Computer Groups";
pub const CREATE_SMART_GROUPS: &str = "Create Smart Computer Groups";
pub const READ_SCRIPTS: &str = "Read Scripts";
pub const READ_EXTENSION_ATTRIBUTES: &str = "Read Computer Extension Attributes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub key: &'static str,
    pub usage: &'static str,
    pub description: &'static str,
    /// OR-matched: holding any one of these is enough.
    pub permissions: &'static [&'static str],
    /// May run with an empty argument string.
    pub arg_exempt: bool,
}

const fn spec(
    key: &'static str,
    usage: &'static str,
    description: &'static str,
    permissions: &'static [&'static str],
    arg_exempt: bool,
) -> CommandSpec {
    CommandSpec {
        key,
        usage,
        description,
        permissions,
        arg_exempt,
    }
}

const BUILTIN_COMMANDS: &[CommandSpec] = &[
    spec(
        "appstore",
        "appstore <all [N] | computer...>",
        "list app store apps installed per client or the most installed across the fleet",
        &[READ_COMPUTERS],
        false,
    ),
    spec(
        "count_group",
        "count group <group_name> <create_if_missing_true_false>",
        "count members of smart group",
        &[READ_SMART_GROUPS],
        false,
    ),
    spec(
        "count_computers",
        "count computers <category> <key> <value>",
        "count computers that fall under a subset of info",
        &[READ_COMPUTERS],
        false,
    ),
    spec(
        "create_group",
        "create group \"<group_name>\" \"<criterion_name>\" [\"and|or\"] [\"serial ...\"]",
        "create smart or static group",
        &[CREATE_SMART_GROUPS],
        false,
    ),
    spec(
        "checkin",
        "checkin <all | computer...>",
        "display checkin data for computers",
        &[READ_COMPUTERS],
        false,
    ),
    spec(
        "chart",
        "chart <pie|bar|doughnut> <group...> | chart bar <model|processor|arch|apps>",
        "display a chart image of up to 6 smart groups or by model, processor type and arch",
        &[READ_SMART_GROUPS],
        false,
    ),
    spec(
        "details",
        "details <category> <computer...>",
        "display details of a JAMF category e.g. General",
        &[READ_COMPUTERS],
        false,
    ),
    spec(
        "devicelock",
        "devicelock <computer> <passcode>",
        "send a device lock command to a client",
        &[UPDATE_COMPUTERS],
        false,
    ),
    spec(
        "duplicates",
        "duplicates [all]",
        "list all duplicate JAMF client names",
        &[READ_COMPUTERS],
        true,
    ),
    spec(
        "extattr",
        "extattr <all | extension_attribute_name>",
        "display a list of all or specific extension attribute",
        &[READ_EXTENSION_ATTRIBUTES],
        false,
    ),
    spec(
        "files",
        "files",
        "list download links for all distribution point files",
        &[READ_COMPUTERS],
        true,
    ),
    spec(
        "flush",
        "flush <computer...>",
        "flush pending and failed MDM commands for a client",
        &[UPDATE_COMPUTERS],
        false,
    ),
    spec(
        "lockpass",
        "lockpass <computer...>",
        "display the recovery lock password for a client",
        &[READ_COMPUTERS],
        false,
    ),
    spec(
        "log",
        "log <computer...>",
        "display policy log for a client",
        &[READ_COMPUTERS],
        false,
    ),
    spec(
        "mdmexpiry",
        "mdmexpiry <all | computer...>",
        "display a count and a list of all clients with expired MDM profiles",
        &[READ_COMPUTERS],
        false,
    ),
    spec(
        "mdmcommands",
        "mdmcommands <computer>",
        "display the completed, pending and failed commands sent to a computer",
        &[READ_COMPUTERS],
        false,
    ),
    spec(
        "membership",
        "membership <computer...>",
        "display group membership for a client",
        &[READ_SMART_GROUPS],
        false,
    ),
    spec(
        "reboots",
        "reboots <all | computer...>",
        "display last reboot data for all or specific clients",
        &[READ_COMPUTERS],
        false,
    ),
    spec(
        "redeploy",
        "redeploy <computer...>",
        "redeploy the JAMF framework",
        &[UPDATE_COMPUTERS],
        false,
    ),
    spec(
        "recovery",
        "recovery <computer...>",
        "display recovery key for a client",
        &[READ_COMPUTERS],
        false,
    ),
    spec(
        "show_script",
        "show script <all | script_name>",
        "display a list of all scripts or contents of a script",
        &[READ_SCRIPTS],
        false,
    ),
    spec("help", "help", "display this help", &[READ_COMPUTERS], true),
    spec(
        "commands",
        "commands",
        "list every command with its arguments",
        &[READ_COMPUTERS],
        true,
    ),
];

#[derive(Debug, Clone)]
pub struct CommandRegistry {
    commands: Vec<CommandSpec>,
}

impl CommandRegistry {
    /// Validate and build. Keys must be non-empty, whitespace-free, unique,
    /// carry at least one permission, and no key may be a prefix of another.
    pub fn new(commands: Vec<CommandSpec>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for command in &commands {
            if command.key.is_empty() {
                return Err(RegistryError::EmptyKey);
            }
            if command.key.chars().any(char::is_whitespace) {
                return Err(RegistryError::WhitespaceInKey(command.key.to_string()));
            }
            if !seen.insert(command.key.to_ascii_lowercase()) {
                return Err(RegistryError::DuplicateKey(command.key.to_string()));
            }
            if command.permissions.is_empty() {
                return Err(RegistryError::NoPermissions(command.key.to_string()));
            }
        }

        for a in &commands {
            for b in &commands {
                if a.key.len() < b.key.len()
                    && b.key.to_ascii_lowercase().starts_with(&a.key.to_ascii_lowercase())
                {
                    return Err(RegistryError::PrefixCollision {
                        shorter: a.key.to_string(),
                        longer: b.key.to_string(),
                    });
                }
            }
        }

        Ok(Self { commands })
    }

    pub fn builtin() -> Result<Self, RegistryError> {
        Self::new(BUILTIN_COMMANDS.to_vec())
    }

    pub fn get(&self, key: &str) -> Option<&CommandSpec> {
        self.commands
            .iter()
            .find(|c| c.key.eq_ignore_ascii_case(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.commands.iter().map(|c| c.key)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
