// ABOUTME: Typed messages exchanged between workers, and the queues that carry them.
// ABOUTME: Queues keep their receiving end shared so a restarted worker re-binds without losing items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Ref used for pushes synthesized from operator commands.
pub const OPERATOR_GITREF: &str = "refs/operator/highstate";

/// How a target string is matched against fleet members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    #[default]
    Glob,
    Pcre,
    List,
    Grain,
    GrainPcre,
    Pillar,
    Nodegroup,
    Range,
    Compound,
    Ipcidr,
}

impl SelectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Glob => "glob",
            Self::Pcre => "pcre",
            Self::List => "list",
            Self::Grain => "grain",
            Self::GrainPcre => "grain_pcre",
            Self::Pillar => "pillar",
            Self::Nodegroup => "nodegroup",
            Self::Range => "range",
            Self::Compound => "compound",
            Self::Ipcidr => "ipcidr",
        }
    }
}

impl std::fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SelectorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "glob" => Ok(Self::Glob),
            "pcre" => Ok(Self::Pcre),
            "list" => Ok(Self::List),
            "grain" => Ok(Self::Grain),
            "grain_pcre" => Ok(Self::GrainPcre),
            "pillar" => Ok(Self::Pillar),
            "nodegroup" => Ok(Self::Nodegroup),
            "range" => Ok(Self::Range),
            "compound" => Ok(Self::Compound),
            "ipcidr" => Ok(Self::Ipcidr),
            _ => anyhow::bail!("Unknown selector kind: {}", s),
        }
    }
}

/// A normalized source-control push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub gitref: String,
    pub repo_name: String,
    pub repo_url: String,
    pub commit_id: String,
    pub commit_msg: String,
    pub commit_ts: String,
    pub commit_url: String,
    pub commit_author: String,
    pub pusher: String,
    pub received_at: DateTime<Utc>,
}

impl PushEvent {
    /// Branch name from the ref: everything after the second `/`
    /// (`refs/heads/feature/x` -> `feature/x`).
    pub fn branch(&self) -> Option<&str> {
        self.gitref.splitn(3, '/').nth(2).filter(|b| !b.is_empty())
    }

    /// Synthesize the audit record for an operator-requested run.
    pub fn from_operator(request: &OperatorHighstate) -> Self {
        Self {
            gitref: OPERATOR_GITREF.to_string(),
            repo_name: "operator".to_string(),
            repo_url: String::new(),
            commit_id: String::new(),
            commit_msg: format!("highstate {} requested by {}", request.target, request.who),
            commit_ts: Utc::now().to_rfc3339(),
            commit_url: String::new(),
            commit_author: request.who.clone(),
            pusher: request.who.clone(),
            received_at: Utc::now(),
        }
    }
}

/// A run requested by an operator through chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorHighstate {
    pub who: String,
    pub target: String,
    pub selector_kind: SelectorKind,
    pub wait_for_sync: bool,
}

/// Everything the Exchange accepts on its request queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeRequest {
    Push(PushEvent),
    OperatorHighstate(OperatorHighstate),
}

/// Instruction for the JobExecutor to start one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDispatch {
    pub target: String,
    pub selector_kind: SelectorKind,
    pub wait_for_sync: bool,
    pub push_id: i64,
}

/// One state result reported by a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResult {
    pub key_state: Option<String>,
    pub key_id: Option<String>,
    pub key_name: Option<String>,
    pub key_func: Option<String>,
    pub comment: Option<String>,
    pub result: bool,
    pub run_num: Option<i64>,
    pub changed: Option<bool>,
    /// Raw JSON of the state's return
    pub output: String,
}

/// One reported unit of work for a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetResult {
    State(StateResult),
    /// Opaque error record returned instead of state results
    Error { output: String },
}

impl TargetResult {
    pub fn outcome(&self) -> bool {
        match self {
            Self::State(state) => state.result,
            Self::Error { .. } => false,
        }
    }
}

/// Events the JobExecutor sends back to the Exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    JobStarted {
        run_id: String,
        target: String,
        selector_kind: SelectorKind,
        push_id: i64,
        /// Expected targets, fixed at dispatch time
        targets: Vec<String>,
    },
    TargetResult {
        run_id: String,
        target: String,
        result: TargetResult,
    },
    JobResult {
        run_id: String,
        all_ok: bool,
        reported: usize,
        expected: usize,
    },
    DispatchFailed {
        target: String,
        push_id: i64,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    /// The shared channel
    Broadcast,
    /// A private message to the named user
    Direct(String),
}

/// An outbound chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOut {
    pub target: ChatTarget,
    pub text: String,
}

impl ChatOut {
    pub fn broadcast(text: impl Into<String>) -> Self {
        Self {
            target: ChatTarget::Broadcast,
            text: text.into(),
        }
    }

    pub fn direct(user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            target: ChatTarget::Direct(user.into()),
            text: text.into(),
        }
    }
}

/// A command line from an owner whose identity was just confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCommand {
    pub user: String,
    pub text: String,
}

pub type QueueSender<T> = mpsc::UnboundedSender<T>;

/// Unbounded queue whose receiving end outlives any single consumer.
pub struct Queue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn sender(&self) -> QueueSender<T> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> QueueReceiver<T> {
        QueueReceiver {
            rx: Arc::clone(&self.rx),
        }
    }

    pub fn send(&self, item: T) {
        // The queue owns its receiver, so the channel cannot be closed
        let _ = self.tx.send(item);
    }
}

/// Consuming end of a [`Queue`].
pub struct QueueReceiver<T> {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Take one item if one is queued, without waiting.
    pub async fn try_recv(&self) -> Option<T> {
        self.rx.lock().await.try_recv().ok()
    }

    /// Wait up to `timeout` for the next item.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Take every item currently queued.
    pub async fn drain(&self) -> Vec<T> {
        let mut rx = self.rx.lock().await;
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(gitref: &str) -> PushEvent {
        PushEvent {
            gitref: gitref.to_string(),
            repo_name: "myrepo".to_string(),
            repo_url: String::new(),
            commit_id: "abc".to_string(),
            commit_msg: "msg".to_string(),
            commit_ts: String::new(),
            commit_url: String::new(),
            commit_author: "alice".to_string(),
            pusher: "alice".to_string(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_branch_from_ref() {
        assert_eq!(push("refs/heads/main").branch(), Some("main"));
        assert_eq!(push("refs/heads/feature/x").branch(), Some("feature/x"));
        assert_eq!(push("refs/heads/").branch(), None);
        assert_eq!(push("main").branch(), None);
    }

    #[test]
    fn test_selector_kind_parse_and_display() {
        for kind in ["glob", "pcre", "list", "grain", "grain_pcre", "compound"] {
            let parsed: SelectorKind = kind.parse().unwrap();
            assert_eq!(parsed.to_string(), kind);
        }
        assert!("regex".parse::<SelectorKind>().is_err());
    }

    #[test]
    fn test_operator_push_carries_marker() {
        let request = OperatorHighstate {
            who: "alice".to_string(),
            target: "web-*".to_string(),
            selector_kind: SelectorKind::Glob,
            wait_for_sync: false,
        };
        let event = PushEvent::from_operator(&request);
        assert_eq!(event.gitref, OPERATOR_GITREF);
        assert_eq!(event.pusher, "alice");
        assert_eq!(event.commit_author, "alice");
        assert_eq!(event.commit_msg, "highstate web-* requested by alice");
    }

    #[tokio::test]
    async fn test_queue_survives_receiver_handoff() {
        let queue: Queue<u32> = Queue::new();
        queue.send(1);
        queue.send(2);

        let first = queue.receiver();
        assert_eq!(first.try_recv().await, Some(1));
        drop(first);

        let second = queue.receiver();
        assert_eq!(second.try_recv().await, Some(2));
        assert_eq!(second.try_recv().await, None);
    }

    #[tokio::test]
    async fn test_queue_drain_preserves_order() {
        let queue: Queue<&str> = Queue::new();
        let tx = queue.sender();
        tx.send("a").unwrap();
        tx.send("b").unwrap();
        tx.send("c").unwrap();
        assert_eq!(queue.receiver().drain().await, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout_returns_none_when_idle() {
        let queue: Queue<u8> = Queue::new();
        let rx = queue.receiver();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).await, None);
    }
}
