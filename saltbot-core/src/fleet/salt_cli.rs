// ABOUTME: Salt backend driving the `salt` and `salt-run` command line tools.
// ABOUTME: Streams one JSON document per minion return from `salt --out=json`.

use super::{make_run_id, FleetBackend, ReturnBatch, RunHandle};
use crate::messages::SelectorKind;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct SaltCliFleet {
    salt_binary: String,
    salt_run_binary: String,
}

impl SaltCliFleet {
    pub fn new(salt_binary: &str, salt_run_binary: &str) -> Self {
        Self {
            salt_binary: salt_binary.to_string(),
            salt_run_binary: salt_run_binary.to_string(),
        }
    }
}

/// Command line flag selecting how `salt` matches the target.
pub fn selector_flag(kind: SelectorKind) -> Option<&'static str> {
    match kind {
        SelectorKind::Glob => None,
        SelectorKind::Pcre => Some("-E"),
        SelectorKind::List => Some("-L"),
        SelectorKind::Grain => Some("-G"),
        SelectorKind::GrainPcre => Some("-P"),
        SelectorKind::Pillar => Some("-I"),
        SelectorKind::Nodegroup => Some("-N"),
        SelectorKind::Range => Some("-R"),
        SelectorKind::Compound => Some("-C"),
        SelectorKind::Ipcidr => Some("-S"),
    }
}

fn target_args(target: &str, kind: SelectorKind) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(flag) = selector_flag(kind) {
        args.push(flag.to_string());
    }
    args.push(target.to_string());
    args
}

/// Parse `--preview-target` output: a JSON list, or one `- name` per line.
pub fn parse_preview(output: &str) -> Vec<String> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(output.trim()) {
        return items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
    }
    output
        .lines()
        .map(|line| line.trim().trim_start_matches("- ").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// One line of `salt --out=json --out-indent=-1` output.
#[derive(Debug, PartialEq)]
pub enum OutputLine {
    Jid(String),
    Returns(ReturnBatch),
    Other,
}

/// Classify an output line. Minion returns are wrapped as `{"ret": ...}`
/// so they share the batch shape the executor expects.
pub fn parse_output_line(line: &str) -> OutputLine {
    let line = line.trim();
    if let Some(jid) = line.strip_prefix("jid:") {
        return OutputLine::Jid(jid.trim().to_string());
    }
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => OutputLine::Returns(
            map.into_iter()
                .map(|(minion, ret)| (minion, json!({ "ret": ret })))
                .collect(),
        ),
        _ => OutputLine::Other,
    }
}

impl SaltCliFleet {
    async fn preview(&self, target: &str, kind: SelectorKind) -> Result<Vec<String>> {
        let output = Command::new(&self.salt_binary)
            .arg("--preview-target")
            .arg("--out=json")
            .args(target_args(target, kind))
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.salt_binary))?;
        if !output.status.success() {
            anyhow::bail!(
                "Target preview failed ({:?}): {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(parse_preview(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl FleetBackend for SaltCliFleet {
    fn name(&self) -> &'static str {
        "salt"
    }

    fn start_run<'a>(
        &'a self,
        target: &'a str,
        selector_kind: SelectorKind,
    ) -> BoxFuture<'a, Result<RunHandle>> {
        async move {
            let targets = self.preview(target, selector_kind).await?;
            if targets.is_empty() {
                anyhow::bail!("No minions matched {} {}", selector_kind, target);
            }

            let mut args = vec![
                "--show-jid".to_string(),
                "--out=json".to_string(),
                "--out-indent=-1".to_string(),
            ];
            args.extend(target_args(target, selector_kind));
            args.push("state.highstate".to_string());
            tracing::debug!(?args, "Spawning salt");

            let mut child = Command::new(&self.salt_binary)
                .args(&args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("Failed to spawn {}", self.salt_binary))?;

            let stdout = child.stdout.take().context("Failed to capture stdout")?;
            let stderr = child.stderr.take().context("Failed to capture stderr")?;
            let mut lines = BufReader::new(stdout).lines();

            // The job id comes first; anything else before it is noise
            let mut run_id = None;
            let mut early = Vec::new();
            while let Some(line) = lines.next_line().await? {
                match parse_output_line(&line) {
                    OutputLine::Jid(jid) => {
                        run_id = Some(jid);
                        break;
                    }
                    OutputLine::Returns(batch) => {
                        early.push(batch);
                        break;
                    }
                    OutputLine::Other => {
                        tracing::debug!(line = %line, "Ignoring salt output");
                    }
                }
            }
            let run_id = run_id.unwrap_or_else(make_run_id);

            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        tracing::warn!(stderr = %line, "salt stderr");
                    }
                }
            });

            let (tx, rx) = mpsc::unbounded_channel();
            for batch in early {
                let _ = tx.send(batch);
            }
            let reader_run_id = run_id.clone();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    match parse_output_line(&line) {
                        OutputLine::Returns(batch) => {
                            if tx.send(batch).is_err() {
                                tracing::debug!("Return receiver closed, stopping stream");
                                break;
                            }
                        }
                        OutputLine::Jid(_) | OutputLine::Other => {
                            tracing::debug!(line = %line, "Ignoring salt output");
                        }
                    }
                }
                match child.wait().await {
                    Ok(status) if !status.success() => tracing::warn!(
                        run_id = %reader_run_id,
                        code = ?status.code(),
                        "salt exited with failure"
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Failed to wait for salt"),
                }
            });

            let returns = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|batch| (batch, rx))
            })
            .boxed();

            Ok(RunHandle {
                run_id,
                targets,
                returns,
            })
        }
        .boxed()
    }

    fn wait_for_event<'a>(&'a self, tag: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let status = Command::new(&self.salt_run_binary)
                .arg("state.event")
                .arg(format!("tagmatch={}", tag))
                .arg("count=1")
                .stdout(Stdio::null())
                .kill_on_drop(true)
                .status()
                .await
                .with_context(|| format!("Failed to run {}", self.salt_run_binary))?;
            if !status.success() {
                anyhow::bail!("Event watcher exited with {:?}", status.code());
            }
            Ok(())
        }
        .boxed()
    }
}
