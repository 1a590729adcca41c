// ABOUTME: IRC chat interface -- connects, joins the channel, relays status lines and owner commands.
// ABOUTME: Owner commands pass through the NickServ identity gate before reaching the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use saltbot_core::identity::AUTHENTICATE_REPLY;
use saltbot_core::{
    ChatCommand, ChatOut, ChatTarget, Config, GateAction, IdentityGate, QueueReceiver,
    QueueSender,
};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

const OUTBOUND_TICK: Duration = Duration::from_secs(1);
const MAX_LINE_LENGTH: usize = 8192;

pub const READY_MESSAGE: &str = "saltbot ready";

/// One parsed protocol line: `[:prefix] COMMAND params... [:trailing]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcLine {
    /// Nick part of a `nick!user@host` prefix
    pub fn nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|prefix| prefix.split('!').next().unwrap_or(prefix))
    }

    /// Last parameter, which carries the message text for PRIVMSG and NOTICE
    pub fn trailing(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }
}

pub fn parse_line(line: &str) -> Option<IrcLine> {
    let mut rest = line.trim_end_matches(['\r', '\n']);
    let mut prefix = None;

    if let Some(stripped) = rest.strip_prefix(':') {
        let (p, r) = stripped.split_once(' ')?;
        prefix = Some(p.to_string());
        rest = r;
    }

    let rest = rest.trim_start();
    let (head, trailing) = match rest.split_once(" :") {
        Some((head, trailing)) => (head, Some(trailing)),
        None => match rest.strip_prefix(':') {
            Some(trailing) => ("", Some(trailing)),
            None => (rest, None),
        },
    };

    let mut words = head.split_whitespace();
    let command = words.next()?.to_uppercase();
    let mut params: Vec<String> = words.map(str::to_string).collect();
    if let Some(trailing) = trailing {
        params.push(trailing.to_string());
    }

    Some(IrcLine {
        prefix,
        command,
        params,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Joining,
    Ready,
}

/// Protocol state for one connection. Pure: takes lines in, returns lines to send.
pub struct IrcSession {
    state: ConnectionState,
    nick: String,
    channel: String,
    password: Option<String>,
    gate: IdentityGate,
}

impl IrcSession {
    pub fn new(config: &Config) -> Self {
        Self {
            state: ConnectionState::Connecting,
            nick: config.irc.nick.clone(),
            channel: config.irc.channel.clone(),
            password: config.irc.password.clone(),
            gate: IdentityGate::new(config.owners_set()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Registration lines sent right after connecting
    pub fn register(&self) -> Vec<String> {
        vec![
            format!("NICK {}", self.nick),
            format!("USER {} 0 * :saltbot", self.nick),
        ]
    }

    /// React to one server line. Outgoing lines are appended to `out`.
    pub fn handle(&mut self, line: &IrcLine, out: &mut Vec<String>) -> Option<ChatCommand> {
        match line.command.as_str() {
            "PING" => {
                out.push(format!("PONG :{}", line.trailing().unwrap_or_default()));
            }
            "433" => {
                self.nick.push('_');
                tracing::info!(nick = %self.nick, "Nickname in use, trying alternative");
                out.push(format!("NICK {}", self.nick));
            }
            "001" => {
                // The server may have adjusted our nick
                if let Some(nick) = line.params.first() {
                    self.nick = nick.clone();
                }
                tracing::info!(channel = %self.channel, "Welcome received, joining channel");
                if let Some(password) = &self.password {
                    out.push(format!("PRIVMSG NickServ :IDENTIFY {}", password));
                }
                out.push(format!("JOIN {}", self.channel));
                self.state = ConnectionState::Joining;
            }
            "JOIN" => {
                let joined = line.params.first().map(String::as_str).unwrap_or_default();
                let ours = line.nick().is_some_and(|n| n.eq_ignore_ascii_case(&self.nick));
                if ours && joined.eq_ignore_ascii_case(&self.channel) {
                    tracing::info!(channel = %self.channel, "Joined channel");
                    self.state = ConnectionState::Ready;
                    out.push(format!("PRIVMSG {} :{}", self.channel, READY_MESSAGE));
                }
            }
            "PRIVMSG" => {
                let (Some(sender), Some(to), Some(text)) =
                    (line.nick(), line.params.first(), line.trailing())
                else {
                    return None;
                };
                if !to.eq_ignore_ascii_case(&self.nick) || line.params.len() < 2 {
                    return None;
                }
                if let Some(GateAction::Challenge(nick)) = self.gate.on_private_message(sender, text) {
                    out.push(format!("PRIVMSG NickServ :ACC {}", nick));
                }
            }
            "NOTICE" => {
                if !line.nick().is_some_and(|n| n.eq_ignore_ascii_case("NickServ")) {
                    return None;
                }
                match self.gate.on_nickserv_notice(line.trailing()?) {
                    Some(GateAction::Forward(command)) => return Some(command),
                    Some(GateAction::Refuse(nick)) => {
                        out.push(format!("PRIVMSG {} :{}", nick, AUTHENTICATE_REPLY));
                    }
                    Some(GateAction::Challenge(_)) | None => {}
                }
            }
            _ => {}
        }
        None
    }

    /// Protocol lines for one outbound message, one PRIVMSG per text line.
    pub fn render(&self, message: &ChatOut) -> Vec<String> {
        let to = match &message.target {
            ChatTarget::Broadcast => self.channel.as_str(),
            ChatTarget::Direct(user) => user.as_str(),
        };
        // A bare CR ends a line on many servers, so it splits like LF
        message
            .text
            .split(['\r', '\n'])
            .map(|line| line.replace(|c: char| c.is_control(), ""))
            .filter(|line| !line.is_empty())
            .map(|line| format!("PRIVMSG {} :{}", to, line))
            .collect()
    }
}

/// The ChatInterface worker.
pub struct ChatInterface {
    config: Arc<Config>,
    outbound: QueueReceiver<ChatOut>,
    commands: QueueSender<ChatCommand>,
}

impl ChatInterface {
    pub fn new(
        config: Arc<Config>,
        outbound: QueueReceiver<ChatOut>,
        commands: QueueSender<ChatCommand>,
    ) -> Self {
        Self {
            config,
            outbound,
            commands,
        }
    }

    /// Connect and serve until cancelled or the connection drops.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.config.irc.server, self.config.irc.port);
        tracing::info!(addr = %addr, "Connecting to IRC server");
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            stream = TcpStream::connect(&addr) => {
                stream.with_context(|| format!("Failed to connect to {}", addr))?
            }
        };
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut session = IrcSession::new(&self.config);

        for line in session.register() {
            framed.send(line).await?;
        }

        let mut ticker = tokio::time::interval(OUTBOUND_TICK);
        let mut out = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if session.state() == ConnectionState::Ready {
                        for message in self.outbound.drain().await {
                            for line in session.render(&message) {
                                framed.send(line).await?;
                            }
                        }
                    }
                    framed.send("QUIT :saltbot".to_string()).await?;
                    tracing::info!("ChatInterface stopped");
                    return Ok(());
                }
                incoming = framed.next() => {
                    let Some(incoming) = incoming else {
                        anyhow::bail!("IRC connection closed by server");
                    };
                    let raw = incoming.context("Failed to read from IRC server")?;
                    tracing::trace!(line = %raw, "IRC <-");
                    let Some(line) = parse_line(&raw) else {
                        continue;
                    };
                    if let Some(command) = session.handle(&line, &mut out) {
                        if self.commands.send(command).is_err() {
                            tracing::error!("Command queue closed");
                        }
                    }
                    for line in out.drain(..) {
                        framed.send(line).await?;
                    }
                }
                _ = ticker.tick() => {
                    if session.state() != ConnectionState::Ready {
                        continue;
                    }
                    for message in self.outbound.drain().await {
                        for line in session.render(&message) {
                            framed.send(line).await?;
                        }
                    }
                }
            }
        }
    }
}
