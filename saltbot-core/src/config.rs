// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Holds routing rules, ship aliases, IRC/webhook/fleet settings as an immutable snapshot
use crate::messages::SelectorKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "saltbot.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub irc: IrcConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    /// repository full name -> branch -> route
    #[serde(default)]
    pub repos: HashMap<String, HashMap<String, RouteConfig>>,
    #[serde(default)]
    pub logs: LogsConfig,
    /// File this snapshot was read from, reused by `reload`
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct IrcConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default = "default_irc_port")]
    pub port: u16,
    #[serde(default)]
    pub channel: String,
    #[serde(default = "default_nick")]
    pub nick: String,
    /// NickServ password; the bot does not identify when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Nicks allowed to issue commands (each command is re-verified with NickServ)
    #[serde(default)]
    pub owners: Vec<String>,
}

// Custom Debug impl to redact the NickServ password
impl std::fmt::Debug for IrcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrcConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("channel", &self.channel)
            .field("nick", &self.nick)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("owners", &self.owners)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_host")]
    pub host: String,
    #[serde(default = "default_webhook_port")]
    pub port: u16,
    /// Shared secret for the `X-Hub-Signature` HMAC
    #[serde(default)]
    pub secret: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            host: default_webhook_host(),
            port: default_webhook_port(),
            secret: String::new(),
        }
    }
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebConfig {
    /// Base URL of the history viewer, used for run detail links
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Backend type: "salt" or "simulated"
    #[serde(default = "default_fleet_backend")]
    pub backend: String,
    #[serde(default = "default_salt_binary")]
    pub salt_binary: String,
    #[serde(default = "default_salt_run_binary")]
    pub salt_run_binary: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            backend: default_fleet_backend(),
            salt_binary: default_salt_binary(),
            salt_run_binary: default_salt_run_binary(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ship: Option<ShipConfig>,
}

/// Aliases for the `ship` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipConfig {
    /// Target used for `ship it`
    pub it: String,
    /// Template for `ship <alias>`; every `{}` is replaced by the alias
    pub target: String,
    #[serde(default)]
    pub selector_kind: SelectorKind,
}

impl ShipConfig {
    /// Resolve `it` or an alias into a concrete target selector.
    pub fn resolve(&self, alias: &str) -> String {
        if alias == "it" {
            self.it.clone()
        } else {
            self.target.replace("{}", alias)
        }
    }
}

/// Where a push to a configured branch should be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub target: String,
    #[serde(default)]
    pub selector_kind: SelectorKind,
    /// Wait for the fileserver to pick up the push before running
    #[serde(default)]
    pub wait_for_sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    /// Default tracing filter when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            file: None,
        }
    }
}

fn default_irc_port() -> u16 {
    6667
}

fn default_nick() -> String {
    "saltbot".to_string()
}

fn default_database_path() -> String {
    "saltbot.db".to_string()
}

fn default_webhook_host() -> String {
    "127.0.0.1".to_string()
}

fn default_webhook_port() -> u16 {
    8000
}

fn default_fleet_backend() -> String {
    "salt".to_string()
}

fn default_salt_binary() -> String {
    "salt".to_string()
}

fn default_salt_run_binary() -> String {
    "salt-run".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// ~/.config/saltbot/saltbot.toml (or the platform equivalent)
pub fn user_config_file() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "saltbot")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

impl Config {
    /// Find the config file, checking in order:
    /// 1. SALTBOT_CONFIG_PATH env var
    /// 2. ./saltbot.toml
    /// 3. the per-user config directory
    pub fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("SALTBOT_CONFIG_PATH") {
            let path = PathBuf::from(env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }

        user_config_file().filter(|p| p.exists())
    }

    /// Load configuration from the first config file found, with env overrides
    pub fn load() -> Result<Self> {
        let path = Self::find_config_file().context(
            "No config file found (set SALTBOT_CONFIG_PATH or create ./saltbot.toml)",
        )?;
        Self::load_from(&path)
    }

    /// Load configuration from a specific file, with env overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.apply_env_overrides()?;
        config.normalize_and_validate()?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse and validate a TOML document without consulting the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.normalize_and_validate()?;
        Ok(config)
    }

    /// Re-read the file this snapshot came from
    pub fn reread(&self) -> Result<Self> {
        match &self.source {
            Some(path) => Self::load_from(path),
            None => Self::load(),
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("IRC_SERVER") {
            self.irc.server = val;
        }
        if let Ok(val) = std::env::var("IRC_PORT") {
            self.irc.port = val
                .parse()
                .with_context(|| format!("IRC_PORT must be a valid port number, got: {}", val))?;
        }
        if let Ok(val) = std::env::var("IRC_CHANNEL") {
            self.irc.channel = val;
        }
        if let Ok(val) = std::env::var("IRC_NICK") {
            self.irc.nick = val;
        }
        if let Ok(val) = std::env::var("IRC_PASSWORD") {
            self.irc.password = Some(val);
        }
        if let Ok(val) = std::env::var("IRC_OWNERS") {
            self.irc.owners = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = std::env::var("WEBHOOK_SECRET") {
            self.webhook.secret = val;
        }
        if let Ok(val) = std::env::var("WEBHOOK_PORT") {
            self.webhook.port = val.parse().with_context(|| {
                format!("WEBHOOK_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("WEBHOOK_HOST") {
            self.webhook.host = val;
        }
        if let Ok(val) = std::env::var("DATABASE_PATH") {
            self.database.path = val;
        }
        if let Ok(val) = std::env::var("FLEET_BACKEND") {
            self.fleet.backend = val;
        }
        if let Ok(val) = std::env::var("WEB_URL") {
            self.web.url = Some(val);
        }
        Ok(())
    }

    fn normalize_and_validate(&mut self) -> Result<()> {
        if self.irc.server.trim().is_empty() {
            anyhow::bail!("irc.server is required (set in config or IRC_SERVER env var)");
        }
        if self.irc.channel.trim().is_empty() {
            anyhow::bail!("irc.channel is required (set in config or IRC_CHANNEL env var)");
        }
        if self.irc.nick.trim().is_empty() {
            anyhow::bail!("irc.nick cannot be empty");
        }
        self.irc.owners.retain(|s| !s.trim().is_empty());

        if self.webhook.secret.is_empty() {
            anyhow::bail!("webhook.secret is required (set in config or WEBHOOK_SECRET env var)");
        }

        match self.fleet.backend.as_str() {
            "salt" | "simulated" => {}
            other => anyhow::bail!(
                "Unsupported fleet.backend '{}' (expected \"salt\" or \"simulated\")",
                other
            ),
        }

        if let Some(url) = self.web.url.as_mut() {
            while url.ends_with('/') {
                url.pop();
            }
        }

        for (repo, branches) in &self.repos {
            for (branch, route) in branches {
                if route.target.trim().is_empty() {
                    anyhow::bail!("No target specified for repos.{}.{}", repo, branch);
                }
            }
        }

        Ok(())
    }

    /// Look up the route for a push to `branch` of `repo`.
    pub fn route_for(&self, repo: &str, branch: &str) -> Option<&RouteConfig> {
        self.repos.get(repo).and_then(|branches| branches.get(branch))
    }

    /// Settings that load fine but leave part of the bot unusable.
    pub fn warnings(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        if self.irc.owners.is_empty() {
            warnings.push("No IRC owners configured, chat commands cannot be run");
        }
        if self.irc.password.is_none() {
            warnings.push("No IRC password configured, will not identify with NickServ");
        }
        warnings
    }

    /// Emit [`Config::warnings`]. Call once a subscriber is installed.
    pub fn log_warnings(&self) {
        for warning in self.warnings() {
            tracing::warn!("{}", warning);
        }
    }

    /// Owner nicks as a set
    pub fn owners_set(&self) -> HashSet<String> {
        self.irc.owners.iter().cloned().collect()
    }

    /// Link to the history viewer's page for a run, if a viewer is configured
    pub fn run_url(&self, run_id: &str) -> Option<String> {
        self.web.url.as_ref().map(|url| format!("{}/jobs/{}", url, run_id))
    }
}
