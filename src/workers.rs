// ABOUTME: Production WorkerFactory -- binds each worker kind to its real implementation.
// ABOUTME: A worker that fails to start logs the error and exits; the orchestrator restarts it.

use std::sync::Arc;

use saltbot_core::fleet::create_backend;
use saltbot_core::{Config, Exchange, HistoryStore, JobExecutor};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::irc::ChatInterface;
use crate::orchestrator::{Queues, WorkerFactory, WorkerKind};
use crate::webhook;

#[derive(Debug, Default, Clone, Copy)]
pub struct SaltbotWorkers;

impl WorkerFactory for SaltbotWorkers {
    fn spawn(
        &self,
        kind: WorkerKind,
        config: Arc<Config>,
        queues: &Queues,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        match kind {
            WorkerKind::Chat => {
                let chat = ChatInterface::new(
                    config,
                    queues.chat_out.receiver(),
                    queues.commands.sender(),
                );
                tokio::spawn(async move {
                    if let Err(e) = chat.run(cancel).await {
                        tracing::error!(error = %format!("{:#}", e), "ChatInterface failed");
                    }
                })
            }
            WorkerKind::Exchange => {
                let requests = queues.exchange_requests.receiver();
                let events = queues.executor_events.receiver();
                let dispatches = queues.dispatches.sender();
                let chat = queues.chat_out.sender();
                tokio::spawn(async move {
                    let store = match HistoryStore::open(&config.database.path) {
                        Ok(store) => store,
                        Err(e) => {
                            tracing::error!(error = %format!("{:#}", e), "Exchange could not open history store");
                            return;
                        }
                    };
                    Exchange::new(config, store, requests, events, dispatches, chat)
                        .run(cancel)
                        .await;
                })
            }
            WorkerKind::Executor => {
                let dispatches = queues.dispatches.receiver();
                let events = queues.executor_events.sender();
                tokio::spawn(async move {
                    let fleet = match create_backend(&config.fleet) {
                        Ok(fleet) => fleet,
                        Err(e) => {
                            tracing::error!(error = %format!("{:#}", e), "JobExecutor could not create fleet backend");
                            return;
                        }
                    };
                    JobExecutor::new(fleet, dispatches, events).run(cancel).await;
                })
            }
            WorkerKind::Webhook => {
                let requests = queues.exchange_requests.sender();
                tokio::spawn(async move {
                    if let Err(e) = webhook::serve(config, requests, cancel).await {
                        tracing::error!(error = %format!("{:#}", e), "Webhook server failed");
                    }
                })
            }
        }
    }
}
