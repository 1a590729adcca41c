// ABOUTME: Transport-agnostic core of saltbot: routing, run aggregation, identity checks
// ABOUTME: The binary crate wires these workers to IRC, HTTP and the orchestrator

pub mod commands;
pub mod config;
pub mod exchange;
pub mod executor;
pub mod fleet;
pub mod identity;
pub mod messages;
pub mod metrics;
pub mod store;

pub use commands::OperatorCommand;
pub use config::Config;
pub use exchange::Exchange;
pub use executor::JobExecutor;
pub use fleet::{FleetBackend, ReturnBatch, RunHandle};
pub use identity::{GateAction, IdentityGate};
pub use messages::{
    ChatCommand, ChatOut, ChatTarget, ExchangeRequest, ExecutorEvent, JobDispatch,
    OperatorHighstate, PushEvent, Queue, QueueReceiver, QueueSender, SelectorKind, TargetResult,
};
pub use store::HistoryStore;
