// ABOUTME: Simulated fleet that invents targets and state results.
// ABOUTME: Lets saltbot run end to end on a machine without a salt master.

use super::{make_run_id, FleetBackend, ReturnBatch, RunHandle};
use crate::messages::SelectorKind;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::time::Duration;

const PREFIXES: &[&str] = &["endearing", "remarkable", "caring", "delightful", "glowing"];
const SUFFIXES: &[&str] = &["puppy", "kitten", "biscuit", "muffin", "leaf", "flower"];
const STATES: &[&str] = &["file", "user", "service", "pkg", "git", "postgres_user"];
const FUNCS: &[&str] = &["present", "latest", "running", "absent", "username", "installed"];

#[derive(Debug, Clone)]
pub struct SimulatedFleet {
    event_delay: Duration,
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self {
            event_delay: Duration::from_secs(1),
        }
    }
}

impl Default for SimulatedFleet {
    fn default() -> Self {
        Self::new()
    }
}

/// `n` distinct names of the form `prefix.suffix`.
fn random_names(n: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    let n = n.min(PREFIXES.len() * SUFFIXES.len());
    let mut names = BTreeSet::new();
    while names.len() < n {
        let prefix = PREFIXES.choose(&mut rng).copied().unwrap_or("caring");
        let suffix = SUFFIXES.choose(&mut rng).copied().unwrap_or("leaf");
        names.insert(format!("{}.{}", prefix, suffix));
    }
    names.into_iter().collect()
}

fn pick(rng: &mut impl Rng, options: &[&'static str]) -> &'static str {
    options.choose(rng).copied().unwrap_or_default()
}

fn random_results(n: usize) -> Value {
    let mut rng = rand::thread_rng();
    let mut results = Map::new();
    for _ in 0..n {
        let name = pick(&mut rng, SUFFIXES);
        let key = [pick(&mut rng, STATES), pick(&mut rng, SUFFIXES), name, pick(&mut rng, FUNCS)]
            .join("_|-");
        let changes = if rng.gen_ratio(1, 5) {
            json!({"modified": "things"})
        } else {
            json!({})
        };
        let succeeded = !rng.gen_ratio(1, 10);
        let duration = f64::from(rng.gen_range(0..10_000u32)) / 1000.0;
        let run_num: i64 = rng.gen_range(0..200);
        let start = chrono::Local::now().format("%H:%M:%S%.6f").to_string();
        results.insert(
            key,
            json!({
                "comment": "Lorem ipsum dolor sit amet",
                "name": name,
                "start": start,
                "result": succeeded,
                "duration": duration,
                "changes": changes,
                "warnings": ["this was generated by the simulated fleet"],
                "__run_num__": run_num,
            }),
        );
    }
    Value::Object(results)
}

impl FleetBackend for SimulatedFleet {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn start_run<'a>(
        &'a self,
        target: &'a str,
        selector_kind: SelectorKind,
    ) -> BoxFuture<'a, Result<RunHandle>> {
        async move {
            let count = rand::thread_rng().gen_range(1..6);
            let targets = random_names(count);
            let batches: Vec<ReturnBatch> = targets
                .iter()
                .map(|name| {
                    let results = random_results(rand::thread_rng().gen_range(5..15));
                    let mut batch = Map::new();
                    batch.insert(name.clone(), json!({"ret": results, "out": "highstate"}));
                    batch
                })
                .collect();

            let run_id = make_run_id();
            tracing::info!(
                run_id = %run_id,
                selector = %target,
                selector_kind = %selector_kind,
                targets = ?targets,
                "Simulated run started"
            );

            Ok(RunHandle {
                run_id,
                targets,
                returns: futures::stream::iter(batches).boxed(),
            })
        }
        .boxed()
    }

    fn wait_for_event<'a>(&'a self, tag: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            tokio::time::sleep(self.event_delay).await;
            tracing::debug!(tag = %tag, "Simulated event fired");
            Ok(())
        }
        .boxed()
    }
}
