// ABOUTME: Tests for configuration loading, env var overrides and validation
// ABOUTME: Env-mutating tests are serialized so they cannot observe each other

use saltbot_core::config::Config;
use saltbot_core::SelectorKind;
use serial_test::serial;
use std::io::Write;

const ENV_VARS: &[&str] = &[
    "SALTBOT_CONFIG_PATH",
    "IRC_SERVER",
    "IRC_PORT",
    "IRC_CHANNEL",
    "IRC_NICK",
    "IRC_PASSWORD",
    "IRC_OWNERS",
    "WEBHOOK_SECRET",
    "WEBHOOK_PORT",
    "WEBHOOK_HOST",
    "DATABASE_PATH",
    "FLEET_BACKEND",
    "WEB_URL",
];

/// Helper to clear all config-related env vars
fn clear_config_env_vars() {
    for var in ENV_VARS {
        std::env::remove_var(var);
    }
}

const CONFIG: &str = r##"
[irc]
server = "irc.example.net"
channel = "#ops"
password = "nickserv-secret"
owners = ["alice"]

[webhook]
secret = "hunter2"

[commands.ship]
it = "G@roles:web"
target = "{}*"
selector_kind = "compound"

[repos."org/infra".master]
target = "*"
"##;

fn write_config(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("saltbot.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

#[test]
#[serial]
fn test_load_from_file_with_defaults() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, CONFIG);

    let config = Config::load_from(&path).unwrap();
    assert_eq!(config.irc.server, "irc.example.net");
    assert_eq!(config.irc.port, 6667);
    assert_eq!(config.webhook.port, 8000);
    assert_eq!(config.fleet.backend, "salt");
    assert_eq!(config.source.as_deref(), Some(path.as_path()));

    let route = config.route_for("org/infra", "master").unwrap();
    assert_eq!(route.selector_kind, SelectorKind::Glob);
    assert!(!route.wait_for_sync);
}

#[test]
#[serial]
fn test_env_overrides_file_values() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, CONFIG);

    std::env::set_var("IRC_SERVER", "irc.libera.chat");
    std::env::set_var("IRC_PORT", "6697");
    std::env::set_var("IRC_OWNERS", "bob, carol,");
    std::env::set_var("WEBHOOK_SECRET", "from-env");
    std::env::set_var("FLEET_BACKEND", "simulated");
    std::env::set_var("WEB_URL", "https://salt.example.com/");

    let config = Config::load_from(&path).unwrap();
    clear_config_env_vars();

    assert_eq!(config.irc.server, "irc.libera.chat");
    assert_eq!(config.irc.port, 6697);
    assert_eq!(config.irc.owners, vec!["bob", "carol"]);
    assert_eq!(config.webhook.secret, "from-env");
    assert_eq!(config.fleet.backend, "simulated");
    assert_eq!(
        config.run_url("42").as_deref(),
        Some("https://salt.example.com/jobs/42")
    );
}

#[test]
#[serial]
fn test_invalid_port_env_is_rejected() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, CONFIG);

    std::env::set_var("WEBHOOK_PORT", "not-a-port");
    let result = Config::load_from(&path);
    clear_config_env_vars();

    let err = result.unwrap_err();
    assert!(err.to_string().contains("WEBHOOK_PORT"));
}

#[test]
#[serial]
fn test_config_path_env_is_searched_first() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, CONFIG);

    std::env::set_var("SALTBOT_CONFIG_PATH", &path);
    let found = Config::find_config_file();
    clear_config_env_vars();

    assert_eq!(found, Some(path));
}

#[test]
#[serial]
fn test_reread_picks_up_changes() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, CONFIG);
    let config = Config::load_from(&path).unwrap();
    assert!(config.route_for("org/infra", "develop").is_none());

    write_config(
        &dir,
        &format!("{}\n[repos.\"org/infra\".develop]\ntarget = \"dev*\"\n", CONFIG),
    );
    let reloaded = config.reread().unwrap();
    assert_eq!(reloaded.route_for("org/infra", "develop").unwrap().target, "dev*");
}

#[test]
fn test_ship_aliases() {
    let config = Config::from_toml_str(CONFIG).unwrap();
    let ship = config.commands.ship.unwrap();
    assert_eq!(ship.resolve("it"), "G@roles:web");
    assert_eq!(ship.resolve("db"), "db*");
    assert_eq!(ship.selector_kind, SelectorKind::Compound);
}

#[test]
fn test_missing_secret_is_rejected() {
    let content = CONFIG.replace("secret = \"hunter2\"", "secret = \"\"");
    assert!(Config::from_toml_str(&content).is_err());
}

#[test]
fn test_route_without_target_is_rejected() {
    let content = format!("{}\n[repos.\"org/infra\".broken]\ntarget = \"\"\n", CONFIG);
    let err = Config::from_toml_str(&content).unwrap_err();
    assert!(err.to_string().contains("No target specified for repos.org/infra.broken"));
}

#[test]
fn test_debug_redacts_secrets() {
    let config = Config::from_toml_str(CONFIG).unwrap();
    let debug = format!("{:?}", config);
    assert!(!debug.contains("nickserv-secret"));
    assert!(!debug.contains("hunter2"));
}
