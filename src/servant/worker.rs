use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::tickets::{Ticket, TicketQueue};

/// Caller-supplied processing of one ticket.
///
/// Errors are logged by the worker and never stop it; the ticket is recycled
/// either way.
#[async_trait]
pub trait TicketHandler: Send + Sync {
    async fn handle(&self, ticket: &Ticket) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> TicketHandler for F
where
    F: Fn(Ticket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ticket: &Ticket) -> Result<(), HandlerError> {
        self(ticket.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Active,
    Silent,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Active => write!(f, "active"),
            WorkerState::Silent => write!(f, "silent"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Owner side of a spawned worker. Park and resume overwrite one desired-state
/// cell, so the worker always converges on the most recent command.
pub struct WorkerHandle {
    id: u32,
    desired_tx: watch::Sender<WorkerState>,
    stop: CancellationToken,
    state_rx: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker in the active state. It stops when `stop` is cancelled.
    pub fn spawn(
        id: u32,
        queue: Arc<TicketQueue>,
        handler: Arc<dyn TicketHandler>,
        interval: Duration,
        stop: CancellationToken,
    ) -> Self {
        let (desired_tx, desired_rx) = watch::channel(WorkerState::Active);
        let (state_tx, state_rx) = watch::channel(WorkerState::Active);

        let worker = Worker {
            id,
            queue,
            handler,
            interval,
            desired_rx,
            stop: stop.clone(),
            state_tx,
        };
        let task = tokio::spawn(worker.run());

        Self {
            id,
            desired_tx,
            stop,
            state_rx,
            task,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state_rx.clone()
    }

    pub fn park(&self) {
        self.desired_tx.send_replace(WorkerState::Silent);
    }

    pub fn resume(&self) {
        self.desired_tx.send_replace(WorkerState::Active);
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop the worker and wait for it to exit. An in-flight handler call is
    /// allowed to finish.
    pub async fn join(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(worker_id = self.id, error = %e, "Worker task panicked");
        }
    }
}

enum Transition {
    Park,
    Stop,
}

struct Worker {
    id: u32,
    queue: Arc<TicketQueue>,
    handler: Arc<dyn TicketHandler>,
    interval: Duration,
    desired_rx: watch::Receiver<WorkerState>,
    stop: CancellationToken,
    state_tx: watch::Sender<WorkerState>,
}

impl Worker {
    async fn run(mut self) {
        tracing::debug!(worker_id = self.id, "Worker started");
        loop {
            match self.active().await {
                Transition::Stop => break,
                Transition::Park => {
                    self.state_tx.send_replace(WorkerState::Silent);
                    tracing::debug!(worker_id = self.id, "Worker parked");
                    if !self.parked().await {
                        break;
                    }
                    self.state_tx.send_replace(WorkerState::Active);
                    tracing::debug!(worker_id = self.id, "Worker resumed");
                }
            }
        }
        self.state_tx.send_replace(WorkerState::Stopped);
        tracing::debug!(worker_id = self.id, "Worker stopped");
    }

    async fn active(&mut self) -> Transition {
        loop {
            if *self.desired_rx.borrow_and_update() == WorkerState::Silent {
                return Transition::Park;
            }
            let ticket = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Transition::Stop,
                changed = self.desired_rx.changed() => {
                    if changed.is_err() {
                        return Transition::Stop;
                    }
                    continue;
                }
                ticket = self.queue.recv() => ticket,
            };
            let Some(ticket) = ticket else {
                return Transition::Stop;
            };

            self.process(ticket).await;

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Transition::Stop,
                changed = self.desired_rx.changed() => {
                    if changed.is_err() {
                        return Transition::Stop;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// False if stopped while parked.
    async fn parked(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            resumed = self.desired_rx.wait_for(|s| *s == WorkerState::Active) => resumed.is_ok(),
        }
    }

    async fn process(&self, ticket: Ticket) {
        if let Err(e) = self.handler.handle(&ticket).await {
            tracing::warn!(
                worker_id = self.id,
                ticket_id = %ticket.id,
                error = %e,
                "Ticket handler failed"
            );
        }
        self.queue.recycle(ticket);
    }
}
