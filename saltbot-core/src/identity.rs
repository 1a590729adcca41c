// ABOUTME: NickServ ACC identity challenge for owner commands.
// ABOUTME: Pure state machine; the IRC transport feeds it lines and performs the returned actions.

use crate::messages::ChatCommand;
use std::collections::HashSet;

/// ACC status code meaning "logged in and recognized".
pub const ACC_IDENTIFIED: &str = "3";

pub const AUTHENTICATE_REPLY: &str = "Please authenticate with NickServ first";

/// What the transport should do after feeding the gate a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateAction {
    /// Ask NickServ about this nick (`PRIVMSG NickServ :ACC <nick>`)
    Challenge(String),
    /// Identity confirmed; hand the command to the orchestrator
    Forward(ChatCommand),
    /// Tell this nick to authenticate
    Refuse(String),
}

/// One in-flight challenge, correlated by the claimed nick only.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingChallenge {
    nick: String,
    command: String,
}

/// Nicks are compared without regard to ASCII case, as IRC servers do.
#[derive(Debug, Default)]
pub struct IdentityGate {
    /// Lowercased owner nicks
    owners: HashSet<String>,
    pending: Option<PendingChallenge>,
}

impl IdentityGate {
    pub fn new(owners: HashSet<String>) -> Self {
        Self {
            owners: owners.iter().map(|nick| nick.to_ascii_lowercase()).collect(),
            pending: None,
        }
    }

    /// A private message arrived from `nick`.
    ///
    /// Owners get a challenge; anything else is ignored. A new challenge
    /// replaces the one in flight, dropping its stored command.
    pub fn on_private_message(&mut self, nick: &str, text: &str) -> Option<GateAction> {
        if !self.owners.contains(&nick.to_ascii_lowercase()) {
            tracing::debug!(nick = %nick, "Ignoring private message from non-owner");
            return None;
        }

        if let Some(previous) = &self.pending {
            tracing::warn!(
                previous = %previous.nick,
                nick = %nick,
                "Replacing pending identity challenge"
            );
        }

        self.pending = Some(PendingChallenge {
            nick: nick.to_string(),
            command: text.trim().to_string(),
        });
        tracing::info!(nick = %nick, "Checking identity with NickServ");
        Some(GateAction::Challenge(nick.to_string()))
    }

    /// A NOTICE from NickServ arrived.
    pub fn on_nickserv_notice(&mut self, text: &str) -> Option<GateAction> {
        let fields: Vec<&str> = text.split(' ').collect();
        let [nick, keyword, code] = fields.as_slice() else {
            tracing::debug!(text = %text, "Ignoring NickServ notice");
            return None;
        };
        if *keyword != "ACC" {
            tracing::debug!(text = %text, "Ignoring NickServ notice");
            return None;
        }

        let matches_pending = self
            .pending
            .as_ref()
            .is_some_and(|p| p.nick.eq_ignore_ascii_case(nick));
        if !matches_pending {
            tracing::warn!(nick = %nick, "ACC reply for a nick with no pending challenge");
            return Some(GateAction::Refuse(nick.to_string()));
        }

        // pending is Some: its nick just matched
        let pending = self.pending.take()?;
        if *code == ACC_IDENTIFIED {
            tracing::info!(nick = %pending.nick, "Identity confirmed");
            Some(GateAction::Forward(ChatCommand {
                user: pending.nick,
                text: pending.command,
            }))
        } else {
            tracing::warn!(nick = %pending.nick, code = %code, "Identity not confirmed");
            Some(GateAction::Refuse(pending.nick))
        }
    }

    pub fn pending_nick(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.nick.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> IdentityGate {
        IdentityGate::new(["alice".to_string(), "bob".to_string()].into_iter().collect())
    }

    #[test]
    fn test_non_owner_is_ignored() {
        let mut gate = gate();
        assert_eq!(gate.on_private_message("mallory", "quit"), None);
        assert_eq!(gate.pending_nick(), None);
    }

    #[test]
    fn test_owner_confirmed_command_is_forwarded() {
        let mut gate = gate();
        assert_eq!(
            gate.on_private_message("alice", "highstate web-*"),
            Some(GateAction::Challenge("alice".to_string()))
        );
        assert_eq!(
            gate.on_nickserv_notice("alice ACC 3"),
            Some(GateAction::Forward(ChatCommand {
                user: "alice".to_string(),
                text: "highstate web-*".to_string(),
            }))
        );
        assert_eq!(gate.pending_nick(), None);
    }

    #[test]
    fn test_unconfirmed_code_discards_command() {
        let mut gate = gate();
        gate.on_private_message("alice", "quit");
        assert_eq!(
            gate.on_nickserv_notice("alice ACC 1"),
            Some(GateAction::Refuse("alice".to_string()))
        );
        assert_eq!(gate.pending_nick(), None);
        // A late confirmation finds nothing to forward
        assert_eq!(
            gate.on_nickserv_notice("alice ACC 3"),
            Some(GateAction::Refuse("alice".to_string()))
        );
    }

    #[test]
    fn test_reply_for_other_nick_keeps_challenge() {
        let mut gate = gate();
        gate.on_private_message("alice", "help");
        assert_eq!(
            gate.on_nickserv_notice("bob ACC 3"),
            Some(GateAction::Refuse("bob".to_string()))
        );
        assert_eq!(gate.pending_nick(), Some("alice"));
    }

    #[test]
    fn test_second_owner_overwrites_first() {
        let mut gate = gate();
        gate.on_private_message("alice", "say one");
        gate.on_private_message("bob", "say two");

        assert_eq!(
            gate.on_nickserv_notice("alice ACC 3"),
            Some(GateAction::Refuse("alice".to_string()))
        );
        assert_eq!(
            gate.on_nickserv_notice("bob ACC 3"),
            Some(GateAction::Forward(ChatCommand {
                user: "bob".to_string(),
                text: "say two".to_string(),
            }))
        );
    }

    #[test]
    fn test_nicks_match_regardless_of_case() {
        let mut gate = IdentityGate::new(["Alice".to_string()].into_iter().collect());
        assert_eq!(
            gate.on_private_message("ALICE", "help"),
            Some(GateAction::Challenge("ALICE".to_string()))
        );
        assert_eq!(
            gate.on_nickserv_notice("alice ACC 3"),
            Some(GateAction::Forward(ChatCommand {
                user: "ALICE".to_string(),
                text: "help".to_string(),
            }))
        );
        assert_eq!(gate.on_private_message("alicia", "help"), None);
    }

    #[test]
    fn test_malformed_notices_are_ignored() {
        let mut gate = gate();
        gate.on_private_message("alice", "help");
        assert_eq!(gate.on_nickserv_notice("alice ACC"), None);
        assert_eq!(gate.on_nickserv_notice("alice ACC 3 extra"), None);
        assert_eq!(gate.on_nickserv_notice("alice STATUS 3"), None);
        assert_eq!(gate.on_nickserv_notice("You are now identified"), None);
        assert_eq!(gate.pending_nick(), Some("alice"));
    }
}
