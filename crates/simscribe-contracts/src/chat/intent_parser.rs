use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SAVEAS_COMMAND, SINGLE_PATH_COMMANDS,
};

/// Parsed REPL input. Slash commands become named actions with arguments;
/// any other non-empty line is a `generate` intent carrying the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        // Unquoted path with spaces.
        _ => parts.join(" "),
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                if !arg.is_empty() {
                    intent
                        .command_args
                        .insert("value".to_string(), Value::String(arg.to_string()));
                }
                return intent;
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                let path = parse_single_path_arg(arg);
                if !path.is_empty() {
                    intent
                        .command_args
                        .insert("path".to_string(), Value::String(path));
                }
                return intent;
            }

            if command == SAVEAS_COMMAND.command {
                let mut intent = Intent::new(SAVEAS_COMMAND.action, text);
                let parts = parse_path_args(arg);
                if let Some(target) = parts.first() {
                    intent.command_args.insert(
                        "target".to_string(),
                        Value::String(target.to_ascii_lowercase()),
                    );
                }
                if parts.len() > 1 {
                    intent
                        .command_args
                        .insert("path".to_string(), Value::String(parts[1..].join(" ")));
                }
                return intent;
            }

            return Intent::new("unknown_command", text);
        }
    }

    let mut intent = Intent::new("generate", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}
