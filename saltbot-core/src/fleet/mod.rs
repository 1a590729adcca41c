// ABOUTME: FleetBackend trait: start a highstate run and stream per-target returns.
// ABOUTME: Backends are chosen by name from the fleet config.

pub mod salt_cli;
pub mod scripted;
pub mod simulated;

use crate::config::FleetConfig;
use crate::messages::SelectorKind;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use std::sync::Arc;

/// One batch of returns: target name -> return document.
///
/// A document carrying results has a `ret` key holding either a map of
/// state results or a list of error messages.
pub type ReturnBatch = Map<String, Value>;

/// A run the fleet accepted.
pub struct RunHandle {
    pub run_id: String,
    /// Targets expected to report, fixed at dispatch time
    pub targets: Vec<String>,
    /// Ends once every target has reported or the backend gives up
    pub returns: BoxStream<'static, ReturnBatch>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("targets", &self.targets)
            .finish_non_exhaustive()
    }
}

pub trait FleetBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Start a highstate against `target`
    fn start_run<'a>(
        &'a self,
        target: &'a str,
        selector_kind: SelectorKind,
    ) -> BoxFuture<'a, Result<RunHandle>>;

    /// Resolve once an event tagged `tag` is seen on the fleet event bus
    fn wait_for_event<'a>(&'a self, tag: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Build the backend named in the config.
pub fn create_backend(config: &FleetConfig) -> Result<Arc<dyn FleetBackend>> {
    match config.backend.as_str() {
        "salt" => Ok(Arc::new(salt_cli::SaltCliFleet::new(
            &config.salt_binary,
            &config.salt_run_binary,
        ))),
        "simulated" => Ok(Arc::new(simulated::SimulatedFleet::new())),
        other => anyhow::bail!("Unknown fleet backend: {}", other),
    }
}

/// Run id format shared by the local backends: a timestamp down to microseconds.
pub fn make_run_id() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S%6f").to_string()
}
