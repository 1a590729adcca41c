// ABOUTME: Tests for push routing, run aggregation and the status lines they produce
// ABOUTME: Drives the Exchange and JobExecutor against a scripted fleet and an in-memory store

use saltbot_core::executor::SYNC_EVENT_TAG;
use saltbot_core::fleet::scripted::{EventScript, ScriptedFleet};
use saltbot_core::messages::{OPERATOR_GITREF, TargetResult};
use saltbot_core::{
    ChatOut, Config, Exchange, ExchangeRequest, ExecutorEvent, HistoryStore, JobDispatch,
    JobExecutor, OperatorHighstate, PushEvent, Queue, SelectorKind,
};
use serde_json::json;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r##"
[irc]
server = "irc.example.net"
channel = "#ops"
owners = ["alice"]

[webhook]
secret = "hunter2"

[repos.myrepo.main]
target = "web-*"

[repos.myrepo.staging]
target = "stage1,stage2"
selector_kind = "list"
wait_for_sync = true
"##;

struct Harness {
    store: HistoryStore,
    exchange: Exchange,
    requests: Queue<ExchangeRequest>,
    events: Queue<ExecutorEvent>,
    dispatches: Queue<JobDispatch>,
    chat: Queue<ChatOut>,
}

fn harness_with(config: Config) -> Harness {
    let store = HistoryStore::open_in_memory().unwrap();
    let requests = Queue::new();
    let events = Queue::new();
    let dispatches = Queue::new();
    let chat = Queue::new();
    let exchange = Exchange::new(
        Arc::new(config),
        store.clone(),
        requests.receiver(),
        events.receiver(),
        dispatches.sender(),
        chat.sender(),
    );
    Harness {
        store,
        exchange,
        requests,
        events,
        dispatches,
        chat,
    }
}

fn harness() -> Harness {
    harness_with(Config::from_toml_str(CONFIG).unwrap())
}

fn push(repo: &str, gitref: &str, msg: &str) -> PushEvent {
    PushEvent {
        gitref: gitref.to_string(),
        repo_name: repo.to_string(),
        repo_url: format!("https://git.example.com/{}", repo),
        commit_id: "deadbeef".to_string(),
        commit_msg: msg.to_string(),
        commit_ts: "2015-06-01T12:00:00+01:00".to_string(),
        commit_url: format!("https://git.example.com/{}/commit/deadbeef", repo),
        commit_author: "alice".to_string(),
        pusher: "alice".to_string(),
        received_at: chrono::Utc::now(),
    }
}

async fn chat_lines(chat: &Queue<ChatOut>) -> Vec<String> {
    chat.receiver()
        .drain()
        .await
        .into_iter()
        .map(|out| out.text)
        .collect()
}

/// Run one dispatch through the executor and feed its events back into the exchange.
/// Log sink shared with a fmt subscriber for the duration of one test.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

async fn execute(h: &Harness, fleet: ScriptedFleet) {
    let executor_events = Queue::new();
    let executor = JobExecutor::new(
        Arc::new(fleet),
        h.dispatches.receiver(),
        executor_events.sender(),
    );
    for dispatch in h.dispatches.receiver().drain().await {
        executor.highstate(dispatch).await;
    }
    for event in executor_events.receiver().drain().await {
        h.exchange.handle_executor_event(event);
    }
}

#[tokio::test]
async fn test_routed_push_announces_and_dispatches() {
    let h = harness();
    h.exchange
        .handle_push(push("myrepo", "refs/heads/main", "fix bug"));

    assert_eq!(
        chat_lines(&h.chat).await,
        vec!["Push to myrepo main by alice: fix bug", "Going to run glob web-*"]
    );
    let dispatches = h.dispatches.receiver().drain().await;
    assert_eq!(
        dispatches,
        vec![JobDispatch {
            target: "web-*".to_string(),
            selector_kind: SelectorKind::Glob,
            wait_for_sync: false,
            push_id: 1,
        }]
    );
    assert_eq!(h.store.count_pushes().unwrap(), 1);
}

#[tokio::test]
async fn test_wait_flag_shows_in_announcement() {
    let h = harness();
    h.exchange
        .handle_push(push("myrepo", "refs/heads/staging", "bump"));

    let lines = chat_lines(&h.chat).await;
    assert_eq!(lines[1], "Going to run list stage1,stage2 after fileserver sync");
    let dispatches = h.dispatches.receiver().drain().await;
    assert!(dispatches[0].wait_for_sync);
}

#[tokio::test]
async fn test_unrouted_push_is_recorded_but_not_dispatched() {
    let h = harness();
    h.exchange
        .handle_push(push("myrepo", "refs/heads/feature/x", "wip"));
    h.exchange
        .handle_push(push("otherrepo", "refs/heads/main", "hello"));

    assert!(chat_lines(&h.chat).await.is_empty());
    assert!(h.dispatches.receiver().drain().await.is_empty());
    assert_eq!(h.store.count_pushes().unwrap(), 2);
}

#[tokio::test]
async fn test_long_commit_message_is_truncated() {
    let h = harness();
    let long = "x".repeat(100);
    h.exchange
        .handle_push(push("myrepo", "refs/heads/main", &long));

    let lines = chat_lines(&h.chat).await;
    assert_eq!(
        lines[0],
        format!("Push to myrepo main by alice: {}...", "x".repeat(77))
    );
}

#[tokio::test]
async fn test_operator_highstate_skips_routing() {
    let h = harness();
    h.exchange.handle_operator_push(OperatorHighstate {
        who: "alice".to_string(),
        target: "db*".to_string(),
        selector_kind: SelectorKind::Glob,
        wait_for_sync: false,
    });

    assert_eq!(
        chat_lines(&h.chat).await,
        vec!["alice requested a run", "Going to run glob db*"]
    );
    let dispatches = h.dispatches.receiver().drain().await;
    assert_eq!(dispatches.len(), 1);

    let stored = h.store.get_push(dispatches[0].push_id).unwrap().unwrap();
    assert_eq!(stored.event.gitref, OPERATOR_GITREF);
    assert_eq!(stored.event.pusher, "alice");
    assert_eq!(stored.event.commit_msg, "highstate db* requested by alice");
}

#[tokio::test]
async fn test_partial_run_reports_missing_results() {
    let h = harness();
    h.exchange
        .handle_push(push("myrepo", "refs/heads/main", "fix bug"));
    chat_lines(&h.chat).await;

    let fleet = ScriptedFleet::new()
        .expect_run("20150601120000000001", &["web1", "web2", "web3"])
        .returns(json!({"web1": {"ret": {"pkg_|-nginx_|-nginx_|-installed": {"result": true, "__run_num__": 0, "changes": {}}}}}))
        .returns(json!({}))
        .returns(json!({"web2": {"ret": {"file_|-motd_|-/etc/motd_|-managed": {"result": true, "__run_num__": 1, "changes": {}}}}}))
        .done();
    execute(&h, fleet).await;

    assert_eq!(
        chat_lines(&h.chat).await,
        vec![
            "Run 20150601120000000001 started against web1, web2, web3",
            "Run 20150601120000000001 finished, only 2/3 results",
        ]
    );

    let job = h.store.get_job("20150601120000000001").unwrap().unwrap();
    assert_eq!(job.push_id, Some(1));
    assert_eq!(job.target, "web-*");
    let targets = h.store.job_targets(job.id).unwrap();
    let names: Vec<&str> = targets.iter().map(|t| t.target.as_str()).collect();
    assert_eq!(names, vec!["web1", "web2", "web3"]);
    assert_eq!(h.store.results_for_target(targets[0].id).unwrap().len(), 1);
    assert!(h.store.results_for_target(targets[2].id).unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_state_reports_some_errors() {
    let h = harness();
    h.exchange
        .handle_push(push("myrepo", "refs/heads/main", "fix bug"));
    chat_lines(&h.chat).await;

    let fleet = ScriptedFleet::new()
        .expect_run("j2", &["web1", "web2"])
        .returns(json!({"web1": {"ret": {"a_|-b_|-c_|-d": {"result": true}}}}))
        .returns(json!({"web2": {"ret": {"a_|-b_|-c_|-d": {"result": false, "comment": "boom"}}}}))
        .done();
    execute(&h, fleet).await;

    let lines = chat_lines(&h.chat).await;
    assert_eq!(lines.last().unwrap(), "Run j2 finished, some errors");
}

#[tokio::test]
async fn test_error_list_is_stored_as_error_records() {
    let h = harness();
    h.exchange
        .handle_push(push("myrepo", "refs/heads/main", "fix bug"));
    chat_lines(&h.chat).await;

    let fleet = ScriptedFleet::new()
        .expect_run("j3", &["web1"])
        .returns(json!({"web1": {"ret": ["Rendering SLS 'base:web' failed"]}}))
        .done();
    execute(&h, fleet).await;

    let lines = chat_lines(&h.chat).await;
    assert_eq!(lines.last().unwrap(), "Run j3 finished, some errors");

    let job = h.store.get_job("j3").unwrap().unwrap();
    let targets = h.store.job_targets(job.id).unwrap();
    let results = h.store.results_for_target(targets[0].id).unwrap();
    assert_eq!(results.len(), 1);
    assert!(matches!(&results[0], TargetResult::Error { output } if output.contains("Rendering SLS")));
}

#[tokio::test]
async fn test_clean_run_with_details_link() {
    let config = Config::from_toml_str(&format!("{}\n[web]\nurl = \"https://salt.example.com/\"\n", CONFIG)).unwrap();
    let h = harness_with(config);
    h.exchange
        .handle_push(push("myrepo", "refs/heads/main", "fix bug"));
    chat_lines(&h.chat).await;

    let fleet = ScriptedFleet::new()
        .expect_run("j4", &["web1"])
        .returns(json!({"web1": {"ret": {"a_|-b_|-c_|-d": {"result": true}}}}))
        .done();
    execute(&h, fleet).await;

    assert_eq!(
        chat_lines(&h.chat).await,
        vec![
            "Run j4 started against web1",
            "Details: https://salt.example.com/jobs/j4",
            "Run j4 finished, all OK",
        ]
    );
}

#[tokio::test]
async fn test_dispatch_failure_is_reported() {
    let h = harness();
    h.exchange
        .handle_push(push("myrepo", "refs/heads/main", "fix bug"));
    chat_lines(&h.chat).await;

    let fleet = ScriptedFleet::new().fail_next_run("master unreachable");
    execute(&h, fleet).await;

    assert_eq!(
        chat_lines(&h.chat).await,
        vec!["Run for web-* could not be started: master unreachable"]
    );
    assert_eq!(h.store.count_jobs().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sync_wait_times_out_and_runs_anyway() {
    let logs = CapturedLogs::default();
    let sink = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || sink.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness();
    h.exchange
        .handle_push(push("myrepo", "refs/heads/staging", "bump"));
    chat_lines(&h.chat).await;

    let fleet = ScriptedFleet::new()
        .with_events(EventScript::Never)
        .expect_run("j5", &["stage1"])
        .returns(json!({"stage1": {"ret": {"a_|-b_|-c_|-d": {"result": true}}}}))
        .done();
    let observer = fleet.clone();
    execute(&h, fleet).await;

    assert_eq!(observer.event_waits(), vec![SYNC_EVENT_TAG.to_string()]);
    assert_eq!(
        observer.dispatched(),
        vec![("stage1,stage2".to_string(), SelectorKind::List)]
    );
    let lines = chat_lines(&h.chat).await;
    assert_eq!(lines.last().unwrap(), "Run j5 finished, all OK");

    let text = logs.text();
    assert_eq!(
        text.matches("Timed out waiting for fileserver sync, running anyway")
            .count(),
        1,
        "captured logs: {}",
        text
    );
}

#[tokio::test]
async fn test_sync_feed_error_still_runs() {
    let h = harness();
    h.exchange
        .handle_push(push("myrepo", "refs/heads/staging", "bump"));
    chat_lines(&h.chat).await;

    let fleet = ScriptedFleet::new()
        .with_events(EventScript::Fail("event bus closed".to_string()))
        .expect_run("j6", &["stage1"])
        .done();
    let observer = fleet.clone();
    execute(&h, fleet).await;

    assert_eq!(observer.dispatched().len(), 1);
    let lines = chat_lines(&h.chat).await;
    assert_eq!(lines.last().unwrap(), "Run j6 finished, only 0/1 results");
}

#[tokio::test]
async fn test_exchange_loop_processes_requests_until_cancelled() {
    let h = harness();
    let requests = h.requests.clone();
    let events = h.events.clone();
    let chat = h.chat.clone();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(h.exchange.run(cancel.clone()));

    requests.send(ExchangeRequest::Push(push("myrepo", "refs/heads/main", "fix bug")));
    let first = chat.receiver().recv_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(first.text, "Push to myrepo main by alice: fix bug");

    events.send(ExecutorEvent::JobResult {
        run_id: "j7".to_string(),
        all_ok: true,
        reported: 0,
        expected: 0,
    });
    let mut seen = Vec::new();
    while let Some(out) = chat.receiver().recv_timeout(Duration::from_secs(5)).await {
        seen.push(out.text.clone());
        if out.text.starts_with("Run j7") {
            break;
        }
    }
    assert!(seen.contains(&"Run j7 finished, all OK".to_string()));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
