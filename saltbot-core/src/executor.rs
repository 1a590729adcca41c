// ABOUTME: JobExecutor worker - dispatches highstate runs and aggregates per-target returns.
// ABOUTME: Reports everything to the Exchange as ExecutorEvents; never touches the store.

use crate::fleet::{FleetBackend, ReturnBatch};
use crate::messages::{
    ExecutorEvent, JobDispatch, QueueReceiver, QueueSender, StateResult, TargetResult,
};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Event tag announcing the fileserver picked up new commits.
pub const SYNC_EVENT_TAG: &str = "salt/fileserver/gitfs/update";

/// How long to wait for the sync event before running anyway.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Split `state_|-id_|-name_|-func` into its four parts.
///
/// Returns all `None` unless the key has exactly four parts.
pub fn parse_state_key(
    key: &str,
) -> (Option<String>, Option<String>, Option<String>, Option<String>) {
    let parts: Vec<&str> = key.split("_|-").collect();
    match parts.as_slice() {
        [state, id, name, func] => (
            Some(state.to_string()),
            Some(id.to_string()),
            Some(name.to_string()),
            Some(func.to_string()),
        ),
        _ => (None, None, None, None),
    }
}

/// Build a state result from one entry of a resource map.
///
/// Returns `None` when the value is not an object. The second element is
/// true when the entry carries an explicit `result: false`.
pub fn parse_state_result(key: &str, value: &Value) -> Option<(StateResult, bool)> {
    let fields = value.as_object()?;
    let (key_state, key_id, key_name, key_func) = parse_state_key(key);

    let explicit = fields.get("result").and_then(Value::as_bool);
    let comment = fields.get("comment").and_then(|c| match c {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    });
    let changed = fields.get("changes").map(|c| match c {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Null => false,
        _ => true,
    });

    let state = StateResult {
        key_state,
        key_id,
        key_name,
        key_func,
        comment,
        result: explicit.unwrap_or(false),
        run_num: fields.get("__run_num__").and_then(Value::as_i64),
        changed,
        output: value.to_string(),
    };
    Some((state, explicit == Some(false)))
}

/// Running totals for one run.
#[derive(Debug)]
pub struct RunTally {
    expected: Vec<String>,
    reported: HashSet<String>,
    all_ok: bool,
}

impl RunTally {
    pub fn new(expected: Vec<String>) -> Self {
        Self {
            expected,
            reported: HashSet::new(),
            all_ok: true,
        }
    }

    pub fn all_ok(&self) -> bool {
        self.all_ok
    }

    pub fn reported(&self) -> usize {
        self.reported.len()
    }

    pub fn expected(&self) -> usize {
        self.expected.len()
    }

    /// Fold one batch into the tally, returning the results to persist.
    pub fn absorb(&mut self, batch: &ReturnBatch) -> Vec<(String, TargetResult)> {
        let mut results = Vec::new();

        for (target, document) in batch {
            if !self.expected.iter().any(|t| t == target) {
                tracing::warn!(node = %target, "Return from unexpected target, skipping");
                continue;
            }
            let Some(ret) = document.get("ret") else {
                tracing::debug!(node = %target, "Return without payload, skipping");
                continue;
            };

            if self.reported.insert(target.clone()) {
                tracing::info!(node = %target, "Processing results");
            }

            match ret {
                Value::Array(errors) => {
                    tracing::warn!(node = %target, errors = ?errors, "Target returned errors");
                    self.all_ok = false;
                    for error in errors {
                        results.push((
                            target.clone(),
                            TargetResult::Error {
                                output: error.to_string(),
                            },
                        ));
                    }
                }
                Value::Object(states) => {
                    for (key, value) in states {
                        match parse_state_result(key, value) {
                            Some((state, failed)) => {
                                if failed {
                                    self.all_ok = false;
                                }
                                results.push((target.clone(), TargetResult::State(state)));
                            }
                            None => {
                                tracing::debug!(node = %target, key = %key, "Non-object state value, skipping")
                            }
                        }
                    }
                }
                other => {
                    // A bare string or number is how a target reports a failure to render
                    tracing::warn!(node = %target, ret = %other, "Target returned an error");
                    self.all_ok = false;
                    results.push((
                        target.clone(),
                        TargetResult::Error {
                            output: other.to_string(),
                        },
                    ));
                }
            }
        }

        results
    }
}

pub struct JobExecutor {
    fleet: Arc<dyn FleetBackend>,
    dispatches: QueueReceiver<JobDispatch>,
    events: QueueSender<ExecutorEvent>,
    sync_timeout: Duration,
}

impl JobExecutor {
    pub fn new(
        fleet: Arc<dyn FleetBackend>,
        dispatches: QueueReceiver<JobDispatch>,
        events: QueueSender<ExecutorEvent>,
    ) -> Self {
        Self {
            fleet,
            dispatches,
            events,
            sync_timeout: SYNC_TIMEOUT,
        }
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Take dispatches one at a time until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(backend = self.fleet.name(), "JobExecutor started");
        loop {
            let dispatch = tokio::select! {
                _ = cancel.cancelled() => break,
                dispatch = self.dispatches.recv_timeout(POLL_INTERVAL) => dispatch,
            };
            if let Some(dispatch) = dispatch {
                self.highstate(dispatch).await;
            }
        }
        tracing::info!("JobExecutor stopped");
    }

    /// Run one highstate to completion.
    pub async fn highstate(&self, dispatch: JobDispatch) {
        let JobDispatch {
            target,
            selector_kind,
            wait_for_sync,
            push_id,
        } = dispatch;
        tracing::info!(
            selector = %target,
            selector_kind = %selector_kind,
            wait_for_sync,
            push_id,
            "Highstate requested"
        );

        if wait_for_sync {
            self.wait_for_sync().await;
        }

        let run = match self.fleet.start_run(&target, selector_kind).await {
            Ok(run) => run,
            Err(e) => {
                tracing::error!(selector = %target, error = %e, "Failed to start run");
                self.emit(ExecutorEvent::DispatchFailed {
                    target,
                    push_id,
                    error: e.to_string(),
                });
                return;
            }
        };

        let run_id = run.run_id;
        tracing::info!(run_id = %run_id, targets = ?run.targets, "Run started");
        self.emit(ExecutorEvent::JobStarted {
            run_id: run_id.clone(),
            target,
            selector_kind,
            push_id,
            targets: run.targets.clone(),
        });

        let mut tally = RunTally::new(run.targets);
        let mut returns = run.returns;
        while let Some(batch) = returns.next().await {
            if batch.is_empty() {
                tracing::trace!(run_id = %run_id, "No update yet");
                continue;
            }
            for (target, result) in tally.absorb(&batch) {
                self.emit(ExecutorEvent::TargetResult {
                    run_id: run_id.clone(),
                    target,
                    result,
                });
            }
        }

        tracing::info!(
            run_id = %run_id,
            reported = tally.reported(),
            expected = tally.expected(),
            all_ok = tally.all_ok(),
            "Run finished"
        );
        self.emit(ExecutorEvent::JobResult {
            run_id,
            all_ok: tally.all_ok(),
            reported: tally.reported(),
            expected: tally.expected(),
        });
    }

    async fn wait_for_sync(&self) {
        tracing::info!(tag = SYNC_EVENT_TAG, "Waiting for fileserver sync");
        match tokio::time::timeout(self.sync_timeout, self.fleet.wait_for_event(SYNC_EVENT_TAG))
            .await
        {
            Ok(Ok(())) => tracing::info!("Fileserver sync seen"),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Error watching fleet events, running anyway")
            }
            Err(_) => tracing::warn!(
                timeout_secs = self.sync_timeout.as_secs(),
                "Timed out waiting for fileserver sync, running anyway"
            ),
        }
    }

    fn emit(&self, event: ExecutorEvent) {
        if self.events.send(event).is_err() {
            tracing::error!("Executor event queue closed");
        }
    }
}
