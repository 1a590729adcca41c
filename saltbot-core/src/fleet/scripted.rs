// ABOUTME: Scripted fleet for tests - replays pre-configured runs and events.
// ABOUTME: Records every dispatch so tests can assert on what was started.
//!
//! # Example
//!
//! ```no_run
//! use saltbot_core::fleet::scripted::ScriptedFleet;
//! use serde_json::json;
//!
//! let fleet = ScriptedFleet::new()
//!     .expect_run("20240101", &["web1", "web2"])
//!     .returns(json!({"web1": {"ret": {"file_|-a_|-/etc/a_|-managed": {"result": true}}}}))
//!     .returns(json!({"web2": {"ret": ["Rendering SLS failed"]}}))
//!     .done();
//! ```

use super::{FleetBackend, ReturnBatch, RunHandle};
use crate::messages::SelectorKind;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// How `wait_for_event` behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScript {
    /// The event arrives immediately
    Arrive,
    /// The event never arrives
    Never,
    /// The event feed fails with this message
    Fail(String),
}

enum ScriptedRun {
    Run {
        run_id: String,
        targets: Vec<String>,
        batches: Vec<ReturnBatch>,
    },
    Fail(String),
}

#[derive(Clone)]
pub struct ScriptedFleet {
    runs: Arc<Mutex<VecDeque<ScriptedRun>>>,
    events: EventScript,
    dispatched: Arc<Mutex<Vec<(String, SelectorKind)>>>,
    event_waits: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFleet {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(Mutex::new(VecDeque::new())),
            events: EventScript::Arrive,
            dispatched: Arc::new(Mutex::new(Vec::new())),
            event_waits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a run that will be handed out by the next `start_run`
    pub fn expect_run(self, run_id: &str, targets: &[&str]) -> RunBuilder {
        RunBuilder {
            fleet: self,
            run_id: run_id.to_string(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            batches: Vec::new(),
        }
    }

    /// Make the next `start_run` fail
    pub fn fail_next_run(self, message: &str) -> Self {
        self.push_run(ScriptedRun::Fail(message.to_string()));
        self
    }

    pub fn with_events(mut self, events: EventScript) -> Self {
        self.events = events;
        self
    }

    /// Every `(target, selector_kind)` passed to `start_run`, in order
    pub fn dispatched(&self) -> Vec<(String, SelectorKind)> {
        self.dispatched.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Every tag passed to `wait_for_event`, in order
    pub fn event_waits(&self) -> Vec<String> {
        self.event_waits.lock().map(|w| w.clone()).unwrap_or_default()
    }

    fn push_run(&self, run: ScriptedRun) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.push_back(run);
        }
    }
}

impl Default for ScriptedFleet {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RunBuilder {
    fleet: ScriptedFleet,
    run_id: String,
    targets: Vec<String>,
    batches: Vec<ReturnBatch>,
}

impl RunBuilder {
    /// Add one batch of returns; non-object values become an empty batch
    pub fn returns(mut self, batch: Value) -> Self {
        match batch {
            Value::Object(map) => self.batches.push(map),
            _ => self.batches.push(ReturnBatch::new()),
        }
        self
    }

    pub fn done(self) -> ScriptedFleet {
        self.fleet.push_run(ScriptedRun::Run {
            run_id: self.run_id,
            targets: self.targets,
            batches: self.batches,
        });
        self.fleet
    }
}

impl FleetBackend for ScriptedFleet {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn start_run<'a>(
        &'a self,
        target: &'a str,
        selector_kind: SelectorKind,
    ) -> BoxFuture<'a, Result<RunHandle>> {
        async move {
            if let Ok(mut dispatched) = self.dispatched.lock() {
                dispatched.push((target.to_string(), selector_kind));
            }
            let next = self
                .runs
                .lock()
                .map_err(|e| anyhow::anyhow!("Scripted runs poisoned: {}", e))?
                .pop_front();
            match next {
                Some(ScriptedRun::Run {
                    run_id,
                    targets,
                    batches,
                }) => Ok(RunHandle {
                    run_id,
                    targets,
                    returns: futures::stream::iter(batches).boxed(),
                }),
                Some(ScriptedRun::Fail(message)) => Err(anyhow::anyhow!(message)),
                None => anyhow::bail!("No scripted run for target {}", target),
            }
        }
        .boxed()
    }

    fn wait_for_event<'a>(&'a self, tag: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            if let Ok(mut waits) = self.event_waits.lock() {
                waits.push(tag.to_string());
            }
            match &self.events {
                EventScript::Arrive => Ok(()),
                EventScript::Never => futures::future::pending().await,
                EventScript::Fail(message) => Err(anyhow::anyhow!(message.clone())),
            }
        }
        .boxed()
    }
}
