// ABOUTME: Exchange worker - routes pushes to runs and records run history.
// ABOUTME: Sole writer of the history store; produces the status lines shown in chat.

use crate::config::Config;
use crate::messages::{
    ChatOut, ExchangeRequest, ExecutorEvent, JobDispatch, OperatorHighstate, PushEvent,
    QueueReceiver, QueueSender, SelectorKind,
};
use crate::metrics;
use crate::store::HistoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const IDLE_SLEEP: Duration = Duration::from_secs(1);
const COMMIT_MSG_LIMIT: usize = 77;

/// First line of a commit message, cut to 77 characters plus "..." when longer.
///
/// Only the first line is ever reported, so a multi-line message is shortened
/// even when its whole text fits in 77 characters. A bare `\r` also ends the
/// first line.
pub fn truncate_commit_message(message: &str) -> String {
    let first_line = message.split(['\r', '\n']).next().unwrap_or_default();
    if first_line.chars().count() > COMMIT_MSG_LIMIT {
        let cut: String = first_line.chars().take(COMMIT_MSG_LIMIT).collect();
        format!("{}...", cut)
    } else {
        first_line.to_string()
    }
}

pub fn going_to_run_line(selector_kind: SelectorKind, target: &str, wait_for_sync: bool) -> String {
    let suffix = if wait_for_sync {
        " after fileserver sync"
    } else {
        ""
    };
    format!("Going to run {} {}{}", selector_kind, target, suffix)
}

pub fn summary_line(run_id: &str, all_ok: bool, reported: usize, expected: usize) -> String {
    if reported != expected {
        format!(
            "Run {} finished, only {}/{} results",
            run_id, reported, expected
        )
    } else if !all_ok {
        format!("Run {} finished, some errors", run_id)
    } else {
        format!("Run {} finished, all OK", run_id)
    }
}

pub struct Exchange {
    config: Arc<Config>,
    store: HistoryStore,
    requests: QueueReceiver<ExchangeRequest>,
    executor_events: QueueReceiver<ExecutorEvent>,
    dispatches: QueueSender<JobDispatch>,
    chat: QueueSender<ChatOut>,
}

impl Exchange {
    pub fn new(
        config: Arc<Config>,
        store: HistoryStore,
        requests: QueueReceiver<ExchangeRequest>,
        executor_events: QueueReceiver<ExecutorEvent>,
        dispatches: QueueSender<JobDispatch>,
        chat: QueueSender<ChatOut>,
    ) -> Self {
        Self {
            config,
            store,
            requests,
            executor_events,
            dispatches,
            chat,
        }
    }

    /// Poll both inbound queues in turn until cancelled, sleeping when both are empty.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("Exchange started");
        while !cancel.is_cancelled() {
            let mut idle = true;

            if let Some(request) = self.requests.try_recv().await {
                idle = false;
                self.handle_request(request);
            }
            if let Some(event) = self.executor_events.try_recv().await {
                idle = false;
                self.handle_executor_event(event);
            }

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_SLEEP) => {}
                }
            }
        }
        tracing::info!("Exchange stopped");
    }

    pub fn handle_request(&self, request: ExchangeRequest) {
        match request {
            ExchangeRequest::Push(event) => self.handle_push(event),
            ExchangeRequest::OperatorHighstate(request) => self.handle_operator_push(request),
        }
    }

    pub fn handle_executor_event(&self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::JobStarted {
                run_id,
                target,
                selector_kind,
                push_id,
                targets,
            } => self.handle_job_started(&run_id, &target, selector_kind, push_id, &targets),
            ExecutorEvent::TargetResult {
                run_id,
                target,
                result,
            } => {
                if let Err(e) = self.store.insert_result(&run_id, &target, &result) {
                    tracing::error!(run_id = %run_id, node = %target, error = %e, "Failed to store result");
                }
            }
            ExecutorEvent::JobResult {
                run_id,
                all_ok,
                reported,
                expected,
            } => self.handle_job_result(&run_id, all_ok, reported, expected),
            ExecutorEvent::DispatchFailed {
                target,
                push_id,
                error,
            } => {
                tracing::error!(selector = %target, push_id, error = %error, "Run could not be started");
                metrics::record_run_result("dispatch_failed");
                self.say(format!("Run for {} could not be started: {}", target, error));
            }
        }
    }

    /// Record a push and, when its branch is routed, dispatch a run.
    pub fn handle_push(&self, event: PushEvent) {
        let push_id = match self.store.insert_push(&event) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(repo = %event.repo_name, error = %e, "Failed to store push");
                return;
            }
        };

        let Some(branch) = event.branch() else {
            tracing::warn!(gitref = %event.gitref, "Push ref has no branch, ignoring");
            metrics::record_push(false);
            return;
        };

        let Some(route) = self.config.route_for(&event.repo_name, branch) else {
            tracing::info!(
                repo = %event.repo_name,
                branch = %branch,
                "Push was not to a configured branch"
            );
            metrics::record_push(false);
            return;
        };

        tracing::info!(
            repo = %event.repo_name,
            branch = %branch,
            selector = %route.target,
            selector_kind = %route.selector_kind,
            push_id,
            "Push received to a configured branch"
        );
        metrics::record_push(true);

        self.say(format!(
            "Push to {} {} by {}: {}",
            event.repo_name,
            branch,
            event.pusher,
            truncate_commit_message(&event.commit_msg)
        ));
        self.dispatch(JobDispatch {
            target: route.target.clone(),
            selector_kind: route.selector_kind,
            wait_for_sync: route.wait_for_sync,
            push_id,
        });
    }

    /// Record an operator-requested run as a push and dispatch it without routing.
    pub fn handle_operator_push(&self, request: OperatorHighstate) {
        let event = PushEvent::from_operator(&request);
        let push_id = match self.store.insert_push(&event) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(who = %request.who, error = %e, "Failed to store operator push");
                return;
            }
        };
        tracing::info!(
            who = %request.who,
            selector = %request.target,
            push_id,
            "Operator requested a run"
        );

        self.say(format!("{} requested a run", request.who));
        self.dispatch(JobDispatch {
            target: request.target,
            selector_kind: request.selector_kind,
            wait_for_sync: request.wait_for_sync,
            push_id,
        });
    }

    pub fn handle_job_started(
        &self,
        run_id: &str,
        target: &str,
        selector_kind: SelectorKind,
        push_id: i64,
        targets: &[String],
    ) {
        if let Err(e) = self
            .store
            .insert_job(run_id, target, selector_kind, Some(push_id), targets)
        {
            tracing::error!(run_id = %run_id, error = %e, "Failed to store job");
        }
        metrics::record_run_started();

        self.say(format!("Run {} started against {}", run_id, targets.join(", ")));
        if let Some(url) = self.config.run_url(run_id) {
            self.say(format!("Details: {}", url));
        }
    }

    pub fn handle_job_result(&self, run_id: &str, all_ok: bool, reported: usize, expected: usize) {
        let outcome = if reported != expected {
            "partial"
        } else if !all_ok {
            "errors"
        } else {
            "ok"
        };
        tracing::info!(run_id = %run_id, reported, expected, all_ok, outcome, "Run finished");
        metrics::record_run_result(outcome);
        self.say(summary_line(run_id, all_ok, reported, expected));
    }

    fn dispatch(&self, dispatch: JobDispatch) {
        self.say(going_to_run_line(
            dispatch.selector_kind,
            &dispatch.target,
            dispatch.wait_for_sync,
        ));
        if self.dispatches.send(dispatch).is_err() {
            tracing::error!("Dispatch queue closed");
        }
    }

    fn say(&self, text: String) {
        if self.chat.send(ChatOut::broadcast(text)).is_err() {
            tracing::error!("Chat queue closed");
        }
    }
}
