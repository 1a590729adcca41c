// ABOUTME: Orchestrator -- launches the workers, restarts dead ones, runs operator commands.
// ABOUTME: Workers are built by a WorkerFactory so tests can swap in scripted tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use saltbot_core::commands::{help_lines, OperatorCommand};
use saltbot_core::{
    metrics, ChatCommand, ChatOut, Config, ExchangeRequest, ExecutorEvent, JobDispatch,
    OperatorHighstate, Queue, SelectorKind,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_secs(1);
const GRACE_PERIOD: Duration = Duration::from_secs(5);

pub const FAREWELL: &str = "saltbot shutting down, bye!";

/// The supervised workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Chat,
    Exchange,
    Executor,
    Webhook,
}

impl WorkerKind {
    /// Launch order
    pub const ALL: [WorkerKind; 4] = [
        WorkerKind::Chat,
        WorkerKind::Executor,
        WorkerKind::Exchange,
        WorkerKind::Webhook,
    ];

    /// Name accepted by `reload`
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Exchange => "exchange",
            Self::Executor => "executor",
            Self::Webhook => "webhook",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    fn names() -> Vec<&'static str> {
        let mut names: Vec<&'static str> = Self::ALL.iter().map(|k| k.name()).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Every queue in the system. Created once; restarted workers re-bind to the same queues.
#[derive(Clone, Default)]
pub struct Queues {
    pub exchange_requests: Queue<ExchangeRequest>,
    pub executor_events: Queue<ExecutorEvent>,
    pub dispatches: Queue<JobDispatch>,
    pub chat_out: Queue<ChatOut>,
    pub commands: Queue<ChatCommand>,
}

impl Queues {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Builds and launches a fresh worker instance.
pub trait WorkerFactory: Send + Sync {
    fn spawn(
        &self,
        kind: WorkerKind,
        config: Arc<Config>,
        queues: &Queues,
        cancel: CancellationToken,
    ) -> JoinHandle<()>;
}

struct RunningWorker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Whether the control loop should keep going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Orchestrator<F: WorkerFactory> {
    config: Arc<Config>,
    queues: Queues,
    factory: F,
    workers: HashMap<WorkerKind, RunningWorker>,
    grace_period: Duration,
}

impl<F: WorkerFactory> Orchestrator<F> {
    /// Create the orchestrator and all queues. Nothing runs until `start`.
    pub fn new(config: Config, factory: F) -> Self {
        Self {
            config: Arc::new(config),
            queues: Queues::new(),
            factory,
            workers: HashMap::new(),
            grace_period: GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn is_running(&self, kind: WorkerKind) -> bool {
        self.workers
            .get(&kind)
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Launch every worker.
    pub fn start(&mut self) {
        for kind in WorkerKind::ALL {
            self.launch(kind);
        }
        tracing::info!(workers = ?WorkerKind::names(), "All workers launched");
    }

    fn launch(&mut self, kind: WorkerKind) {
        let cancel = CancellationToken::new();
        let handle = self.factory.spawn(
            kind,
            Arc::clone(&self.config),
            &self.queues,
            cancel.clone(),
        );
        tracing::info!(worker = %kind, "Worker launched");
        self.workers.insert(kind, RunningWorker { handle, cancel });
    }

    /// Restart every worker that is no longer alive, returning the ones restarted.
    pub fn supervise(&mut self) -> Vec<WorkerKind> {
        let dead: Vec<WorkerKind> = WorkerKind::ALL
            .into_iter()
            .filter(|kind| !self.is_running(*kind))
            .collect();

        for kind in &dead {
            tracing::warn!(worker = %kind, "Worker not alive, restarting");
            metrics::record_worker_restart(kind.name());
            self.launch(*kind);
        }
        dead
    }

    /// Stop one worker: cancel, wait for the grace period, then abort.
    pub async fn stop_worker(&mut self, kind: WorkerKind) {
        let Some(worker) = self.workers.remove(&kind) else {
            tracing::debug!(worker = %kind, "Worker was never started");
            return;
        };
        let RunningWorker { mut handle, cancel } = worker;
        cancel.cancel();

        match tokio::time::timeout(self.grace_period, &mut handle).await {
            Ok(Ok(())) => tracing::info!(worker = %kind, "Worker stopped"),
            Ok(Err(e)) => tracing::warn!(worker = %kind, error = %e, "Worker ended abnormally"),
            Err(_) => {
                tracing::warn!(worker = %kind, "Worker ignored cancellation, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    /// Stop every worker. Chat goes last so it can deliver queued messages.
    pub async fn shutdown(&mut self) {
        for kind in [
            WorkerKind::Webhook,
            WorkerKind::Exchange,
            WorkerKind::Executor,
            WorkerKind::Chat,
        ] {
            self.stop_worker(kind).await;
        }
        tracing::info!("All workers stopped");
    }

    fn reply(&self, user: &str, text: impl Into<String>) {
        self.queues.chat_out.send(ChatOut::direct(user, text));
    }

    fn broadcast(&self, text: impl Into<String>) {
        self.queues.chat_out.send(ChatOut::broadcast(text));
    }

    fn request_highstate(
        &self,
        who: &str,
        target: String,
        selector_kind: SelectorKind,
        wait_for_sync: bool,
    ) {
        self.queues
            .exchange_requests
            .send(ExchangeRequest::OperatorHighstate(OperatorHighstate {
                who: who.to_string(),
                target,
                selector_kind,
                wait_for_sync,
            }));
    }

    /// Carry out one identity-verified command.
    pub async fn handle_command(&mut self, command: ChatCommand) -> Flow {
        let ChatCommand { user, text } = command;
        let parsed = OperatorCommand::parse(&text);
        tracing::info!(user = %user, command = parsed.name(), "Operator command");
        metrics::record_command(parsed.name());

        match parsed {
            OperatorCommand::Quit => {
                tracing::info!(user = %user, "Quit requested");
                return Flow::Quit;
            }
            OperatorCommand::Say { message } => self.broadcast(message),
            OperatorCommand::Help => self.reply(&user, help_lines(&WorkerKind::names()).join("\n")),
            OperatorCommand::Highstate {
                target,
                selector_kind,
                wait_for_sync,
            } => self.request_highstate(&user, target, selector_kind, wait_for_sync),
            OperatorCommand::Ship { alias } => match &self.config.commands.ship {
                Some(ship) => {
                    let target = ship.resolve(&alias);
                    tracing::info!(alias = %alias, selector = %target, "Ship alias resolved");
                    self.request_highstate(&user, target, ship.selector_kind, false);
                }
                None => self.reply(&user, "No ship targets are configured"),
            },
            OperatorCommand::Reload { module } => self.reload(&user, &module).await,
            OperatorCommand::Invalid(usage) => self.reply(&user, usage),
            OperatorCommand::Unknown(_) => self.reply(&user, "Unknown command"),
        }
        Flow::Continue
    }

    /// Re-read the config and restart exactly one worker with the new snapshot.
    async fn reload(&mut self, user: &str, module: &str) {
        let Some(kind) = WorkerKind::from_name(module) else {
            self.reply(
                user,
                format!(
                    "Unknown module {}, valid modules are: {}",
                    module,
                    WorkerKind::names().join(", ")
                ),
            );
            return;
        };

        match self.config.reread() {
            Ok(config) => {
                config.log_warnings();
                self.config = Arc::new(config);
            }
            Err(e) => {
                tracing::error!(error = %e, "Config reload failed, keeping current config");
                self.reply(user, format!("Could not reload config: {:#}", e));
                return;
            }
        }

        tracing::info!(worker = %kind, "Reloading worker");
        self.stop_worker(kind).await;
        self.launch(kind);
        self.reply(user, format!("Reloaded {}", kind));
    }

    /// Run until `quit` or an interrupt signal.
    pub async fn run(mut self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Start every worker and supervise them until `quit` arrives or
    /// `shutdown` resolves. Either way the farewell is queued and every
    /// worker is stopped before returning.
    pub async fn run_until(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.start();

        tokio::pin!(shutdown);
        let commands = self.queues.commands.receiver();
        let mut ticker = tokio::time::interval(TICK);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.supervise();
                    let mut quit = false;
                    for command in commands.drain().await {
                        if self.handle_command(command).await == Flow::Quit {
                            quit = true;
                            break;
                        }
                    }
                    if quit {
                        break;
                    }
                }
            }
        }

        self.broadcast(FAREWELL);
        self.shutdown().await;
        Ok(())
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
