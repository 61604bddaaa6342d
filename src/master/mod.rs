pub mod accessor;
pub mod dispatch;
pub mod payload;

pub use accessor::{GrpcServantRpc, ServantDirectory, ServantRpc};
pub use dispatch::{
    conservative_average, AuthoritativeTickets, ConservativeAverageDispatch, DispatchPolicy,
    TicketSource,
};
pub use payload::{CurrentDispatch, NewDispatch, PayloadSummary, ServantPayload};

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::coordination::{Election, Role, WatchEvent};
use crate::error::{ClusterError, Result};
use crate::tickets::TicketSet;

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    /// Membership discovered at the start of the cycle
    pub servants: Vec<String>,
    pub assignment: Vec<PayloadSummary>,
    pub pushed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Servants whose push failed; retried next cycle
    pub failed: Vec<String>,
    /// Orphans that were sent an empty set
    pub cleared: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

/// Elected coordinator that rebalances tickets across servants.
pub struct Master {
    election: Arc<dyn Election>,
    directory: ServantDirectory,
    rpc: Arc<dyn ServantRpc>,
    policy: Arc<dyn DispatchPolicy>,
    interval: Duration,
    last_report: ArcSwapOption<DispatchReport>,
}

impl Master {
    pub fn new(
        election: Arc<dyn Election>,
        directory: ServantDirectory,
        rpc: Arc<dyn ServantRpc>,
        policy: Arc<dyn DispatchPolicy>,
        interval: Duration,
    ) -> Self {
        Self {
            election,
            directory,
            rpc,
            policy,
            interval,
            last_report: ArcSwapOption::empty(),
        }
    }

    pub fn role(&self) -> Role {
        *self.election.subscribe().borrow()
    }

    /// Report of the most recent completed cycle, if any ran.
    pub fn last_report(&self) -> Option<Arc<DispatchReport>> {
        self.last_report.load_full()
    }

    /// Take part in the election and dispatch while leader, until `shutdown`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let election_token = shutdown.child_token();
        let election_task = {
            let election = self.election.clone();
            let token = election_token.clone();
            tokio::spawn(async move { election.run(token).await })
        };

        let result = self.lead(&shutdown).await;

        election_token.cancel();
        match election_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Election ended with error"),
            Err(e) => tracing::error!(error = %e, "Election task panicked"),
        }
        tracing::info!("Master stopped");
        result
    }

    async fn lead(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut roles = self.election.subscribe();
        let mut membership = self.directory.watch().await?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                elected = wait_for_leader(&mut roles) => {
                    if !elected {
                        return Err(ClusterError::Coordination("election stopped".to_string()));
                    }
                }
            }
            // The first cycle observes everything that changed while a candidate
            let stale = membership.drain();
            tracing::info!(interval = ?self.interval, stale, "Acting as master");
            self.run_cycle().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    changed = roles.changed() => {
                        if changed.is_err() {
                            return Err(ClusterError::Coordination("election stopped".to_string()));
                        }
                        if *roles.borrow_and_update() != Role::Leader {
                            tracing::info!("Leadership lost, dispatch paused");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.interval) => self.run_cycle().await,
                    event = membership.next() => {
                        match event {
                            Some(WatchEvent::Put { key, .. }) => {
                                tracing::debug!(key = %key, "Servant joined");
                            }
                            Some(WatchEvent::Delete { key }) => {
                                tracing::debug!(key = %key, "Servant left");
                            }
                            Some(WatchEvent::Resync) => {
                                tracing::debug!("Membership watch resynced");
                            }
                            None => {
                                tracing::warn!("Membership watch closed, resubscribing");
                                membership = self.directory.watch().await?;
                            }
                        }
                        let coalesced = membership.drain();
                        if coalesced > 0 {
                            tracing::debug!(coalesced, "Coalesced membership events");
                        }
                        self.run_cycle().await;
                    }
                }
            }
        }
    }

    async fn run_cycle(&self) {
        match self.loop_once().await {
            Ok(report) => tracing::info!(
                servants = report.servants.len(),
                pushed = report.pushed.len(),
                unchanged = report.unchanged.len(),
                failed = report.failed.len(),
                cleared = report.cleared.len(),
                "Dispatch cycle finished"
            ),
            Err(e) => tracing::error!(error = %e, "Dispatch cycle aborted"),
        }
    }

    /// One dispatch cycle: discover, fetch, compute, push, reconcile orphans.
    ///
    /// Membership, fetch and policy failures abort the cycle. Push failures
    /// are recorded in the report and retried next cycle.
    pub async fn loop_once(&self) -> Result<DispatchReport> {
        let servants = self.directory.list_servants().await?;

        let mut observed = Vec::with_capacity(servants.len());
        for servant in &servants {
            let (tickets, stats) = self.rpc.fetch(servant).await?;
            observed.push(ServantPayload::new(servant.clone(), tickets).with_stats(stats));
        }
        let current = CurrentDispatch::new(observed);

        let new_dispatch = self.policy.dispatch(&current)?;

        let mut report = DispatchReport {
            servants: servants.clone(),
            assignment: new_dispatch
                .servant_payloads
                .iter()
                .map(PayloadSummary::from)
                .collect(),
            pushed: Vec::new(),
            unchanged: Vec::new(),
            failed: Vec::new(),
            cleared: Vec::new(),
            finished_at: Utc::now(),
        };

        for payload in &new_dispatch.servant_payloads {
            let servant = &payload.servant_id;
            let unchanged = current
                .get(servant)
                .is_some_and(|held| held.tickets.equals(&payload.tickets));
            if unchanged && !new_dispatch.force_flush {
                tracing::debug!(servant = %servant, "Dispatch unchanged");
                report.unchanged.push(servant.clone());
                continue;
            }

            match self.rpc.push(servant, &payload.tickets).await {
                Ok(()) => {
                    tracing::debug!(
                        servant = %servant,
                        tickets = payload.tickets.len(),
                        summary = %payload.tickets.summary(),
                        "Dispatch pushed"
                    );
                    report.pushed.push(servant.clone());
                }
                Err(e) => {
                    tracing::warn!(servant = %servant, error = %e, "Dispatch push failed");
                    report.failed.push(servant.clone());
                }
            }
        }

        let empty = TicketSet::new();
        for servant in &servants {
            if new_dispatch.get(servant).is_some() {
                continue;
            }
            match self.rpc.push(servant, &empty).await {
                Ok(()) => {
                    tracing::info!(servant = %servant, "Cleared orphaned servant");
                    report.cleared.push(servant.clone());
                }
                Err(e) => {
                    tracing::warn!(servant = %servant, error = %e, "Clearing orphan failed");
                    report.failed.push(servant.clone());
                }
            }
        }

        report.finished_at = Utc::now();
        self.last_report.store(Some(Arc::new(report.clone())));
        Ok(report)
    }
}

/// False if the election is gone before this process became leader.
async fn wait_for_leader(roles: &mut watch::Receiver<Role>) -> bool {
    roles.wait_for(|role| *role == Role::Leader).await.is_ok()
}
