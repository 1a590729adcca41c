// ABOUTME: Root library module exposing all public modules
// ABOUTME: Provides the IRC interface, webhook receiver, orchestrator and worker wiring

pub mod irc;
pub mod logging;
pub mod orchestrator;
pub mod webhook;
pub mod workers;

// Re-export transport-agnostic modules from saltbot-core
pub use saltbot_core::commands;
pub use saltbot_core::config;
pub use saltbot_core::exchange;
pub use saltbot_core::executor;
pub use saltbot_core::fleet;
pub use saltbot_core::identity;
pub use saltbot_core::messages;
pub use saltbot_core::metrics;
pub use saltbot_core::store;
