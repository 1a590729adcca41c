// ABOUTME: Operator command parsing for the chat control channel
// ABOUTME: Closed command enum: quit, say, reload, highstate, ship, help

use crate::messages::SelectorKind;

/// Commands an owner may issue once their identity is confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Say farewell, stop every worker and exit
    Quit,
    /// Say a message on the channel
    Say { message: String },
    /// Re-read config and restart the named worker
    Reload { module: String },
    /// Run a highstate against a target
    Highstate {
        target: String,
        selector_kind: SelectorKind,
        wait_for_sync: bool,
    },
    /// Highstate the `it` target or a configured alias
    Ship { alias: String },
    /// Show available commands
    Help,
    /// A known command with missing or malformed arguments; holds the reply text
    Invalid(String),
    /// Anything else
    Unknown(String),
}

const USAGE_SAY: &str = "Usage: say <message>";
const USAGE_RELOAD: &str = "Usage: reload <module>";
const USAGE_HIGHSTATE: &str = "Usage: highstate <target> [selector_kind] [wait]";
const USAGE_SHIP: &str = "Usage: ship <it|alias>";

impl OperatorCommand {
    /// Parse a command line: the first word is the command, the rest is a single argument string.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        let (cmd, rest) = match input.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (input, ""),
        };

        match cmd.to_lowercase().as_str() {
            "quit" => Self::Quit,
            "help" => Self::Help,
            "say" => {
                if rest.is_empty() {
                    Self::Invalid(USAGE_SAY.to_string())
                } else {
                    Self::Say {
                        message: rest.to_string(),
                    }
                }
            }
            "reload" => {
                if rest.is_empty() {
                    Self::Invalid(USAGE_RELOAD.to_string())
                } else {
                    Self::Reload {
                        module: rest.to_lowercase(),
                    }
                }
            }
            "highstate" => parse_highstate(rest),
            "ship" => {
                if rest.is_empty() {
                    Self::Invalid(USAGE_SHIP.to_string())
                } else {
                    Self::Ship {
                        alias: rest.to_string(),
                    }
                }
            }
            _ => Self::Unknown(input.to_string()),
        }
    }

    /// Command name for metrics and logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Quit => "quit",
            Self::Say { .. } => "say",
            Self::Reload { .. } => "reload",
            Self::Highstate { .. } => "highstate",
            Self::Ship { .. } => "ship",
            Self::Help => "help",
            Self::Invalid(_) => "invalid",
            Self::Unknown(_) => "unknown",
        }
    }
}

fn parse_highstate(rest: &str) -> OperatorCommand {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let Some(target) = parts.first() else {
        return OperatorCommand::Invalid(USAGE_HIGHSTATE.to_string());
    };
    if parts.len() > 3 {
        return OperatorCommand::Invalid(USAGE_HIGHSTATE.to_string());
    }

    let selector_kind = match parts.get(1) {
        Some(kind) => match kind.to_lowercase().parse::<SelectorKind>() {
            Ok(kind) => kind,
            Err(e) => return OperatorCommand::Invalid(e.to_string()),
        },
        None => SelectorKind::default(),
    };

    let wait_for_sync = match parts.get(2) {
        Some(flag) => match parse_flag(flag) {
            Some(flag) => flag,
            None => {
                return OperatorCommand::Invalid(format!(
                    "Wait flag must be true or false, got: {}",
                    flag
                ))
            }
        },
        None => false,
    };

    OperatorCommand::Highstate {
        target: target.to_string(),
        selector_kind,
        wait_for_sync,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "on" | "wait" => Some(true),
        "false" | "no" | "n" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Help text, one line per chat message
pub fn help_lines(modules: &[&str]) -> Vec<String> {
    vec![
        "saltbot commands:".to_string(),
        "  quit                                   Shut saltbot down".to_string(),
        "  help                                   Show this message".to_string(),
        "  say <message>                          Say <message> on the channel".to_string(),
        "  highstate <target> [kind] [wait]       Highstate <target> (kind defaults to glob)"
            .to_string(),
        "  ship <it|alias>                        Highstate the configured ship target".to_string(),
        format!(
            "  reload <module>                        Restart a worker, one of: {}",
            modules.join(", ")
        ),
    ]
}
