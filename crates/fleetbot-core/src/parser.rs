//! Free text to `(command key, argument string)`.

use crate::error::CommandError;
use crate::registry::CommandRegistry;

/// Two-word phrases operators type that map onto a single registry key.
const LEAD_INS: &[(&str, &str, &str)] = &[
    ("count", "group", "count_group"),
    ("count", "computers", "count_computers"),
    ("create", "group", "create_group"),
    ("show", "script", "show_script"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub key: &'static str,
    pub args: String,
}

fn split_word(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(idx) => (&text[..idx], text[idx..].trim_start()),
        None => (text, ""),
    }
}

/// Rewrite a leading two-word lead-in into its key. Only the head of the text
/// is touched; arguments are returned as typed.
pub fn normalize(text: &str) -> String {
    let text = text.trim();
    let (first, rest) = split_word(text);
    let (second, tail) = split_word(rest);
    for (w1, w2, key) in LEAD_INS {
        if first.eq_ignore_ascii_case(w1) && second.eq_ignore_ascii_case(w2) {
            return if tail.is_empty() {
                (*key).to_string()
            } else {
                format!("{} {}", key, tail)
            };
        }
    }
    text.to_string()
}

fn key_matches(text: &str, key: &str) -> bool {
    match text.get(..key.len()) {
        Some(head) if head.eq_ignore_ascii_case(key) => text[key.len()..]
            .chars()
            .next()
            .is_none_or(char::is_whitespace),
        _ => false,
    }
}

/// Match `text` against the registry. The key must be followed by whitespace
/// or the end of the text; the longest matching key wins.
pub fn parse(registry: &CommandRegistry, text: &str) -> Result<ParsedCommand, CommandError> {
    let normalized = normalize(text);
    let spec = registry
        .iter()
        .filter(|c| key_matches(&normalized, c.key))
        .max_by_key(|c| c.key.len())
        .ok_or(CommandError::UnknownCommand)?;

    let args = normalized[spec.key.len()..].trim().to_string();
    if args.is_empty() && !spec.arg_exempt {
        return Err(CommandError::MissingArguments {
            command: spec.key.to_string(),
        });
    }
    Ok(ParsedCommand {
        key: spec.key,
        args,
    })
}
