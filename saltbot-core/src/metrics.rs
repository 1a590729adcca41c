// ABOUTME: Prometheus counters for pushes, runs, commands and worker restarts.
// ABOUTME: The recorder is installed once per process; callers share its handle.

use anyhow::{Context, Result};
use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Mutex;

static HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Install the Prometheus recorder, or return the already-installed handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let mut slot = HANDLE
        .lock()
        .map_err(|_| anyhow::anyhow!("Metrics handle lock poisoned"))?;
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    *slot = Some(handle.clone());
    Ok(handle)
}

pub fn record_push(routed: bool) {
    counter!("saltbot_pushes_total", "routed" => if routed { "true" } else { "false" })
        .increment(1);
}

pub fn record_run_started() {
    counter!("saltbot_runs_total").increment(1);
}

/// outcome: "ok", "errors", "partial" or "dispatch_failed"
pub fn record_run_result(outcome: &'static str) {
    counter!("saltbot_run_results_total", "outcome" => outcome).increment(1);
}

pub fn record_command(command: &'static str) {
    counter!("saltbot_commands_total", "command" => command).increment(1);
}

pub fn record_worker_restart(worker: &'static str) {
    counter!("saltbot_worker_restarts_total", "worker" => worker).increment(1);
}

pub fn record_webhook_request(status: &'static str) {
    counter!("saltbot_webhook_requests_total", "status" => status).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_renders_counters() {
        let first = init_metrics().unwrap();
        let second = init_metrics().unwrap();
        record_push(true);
        record_run_result("ok");
        let rendered = second.render();
        assert!(rendered.contains("saltbot_pushes_total"));
        assert!(first.render().contains("saltbot_run_results_total"));
    }
}
