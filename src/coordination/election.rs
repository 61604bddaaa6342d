use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::coordination::namespace::{LeaseId, Namespace};
use crate::error::{ClusterError, Result};

/// Role of this process in the master election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Leader election primitive driving the master.
///
/// `run` participates until `shutdown` is cancelled and publishes every role
/// transition to subscribers. Leaving `run` releases leadership.
#[async_trait]
pub trait Election: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<Role>;

    async fn run(&self, shutdown: CancellationToken) -> Result<()>;
}

/// Random delay in `[min, 2 * min]` before campaigning again after a lost
/// session, so that candidates do not retry in lockstep.
pub fn retry_delay(min: Duration) -> Duration {
    let min_ms = min.as_millis().max(1) as u64;
    let ms = rand::thread_rng().gen_range(min_ms..=min_ms * 2);
    Duration::from_millis(ms)
}

/// Election over a [`Namespace`]: the leader is whoever created the election
/// key under its own session lease. Losing the lease ends the term.
pub struct LeaseElection {
    namespace: Arc<dyn Namespace>,
    key: String,
    candidate: String,
    ttl: Duration,
    role_tx: watch::Sender<Role>,
}

enum Term {
    Shutdown,
    Lost(ClusterError),
}

impl LeaseElection {
    pub fn new(
        namespace: Arc<dyn Namespace>,
        key: impl Into<String>,
        candidate: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let (role_tx, _) = watch::channel(Role::Candidate);
        Self {
            namespace,
            key: key.into(),
            candidate: candidate.into(),
            ttl,
            role_tx,
        }
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    fn set_role(&self, role: Role) {
        let changed = self.role_tx.send_if_modified(|current| {
            if *current == role {
                false
            } else {
                *current = role;
                true
            }
        });
        if changed {
            tracing::info!(candidate = %self.candidate, role = %role, "Election role changed");
        }
    }

    /// One session: grant a lease, hold or wait for the key, keep the lease
    /// alive. Returns when the session is lost or shutdown is requested.
    async fn session(&self, shutdown: &CancellationToken) -> Result<Term> {
        let lease = self.namespace.grant_lease(self.ttl).await?;
        let term = self.hold(lease, shutdown).await;
        if let Err(e) = self.namespace.revoke_lease(lease).await {
            tracing::debug!(error = %e, "Election lease already gone");
        }
        self.set_role(Role::Candidate);
        Ok(term)
    }

    async fn hold(&self, lease: LeaseId, shutdown: &CancellationToken) -> Term {
        let mut watch = match self.namespace.watch_prefix(&self.key).await {
            Ok(watch) => watch,
            Err(e) => return Term::Lost(e),
        };
        let mut keep_alive = tokio::time::interval((self.ttl / 3).max(Duration::from_millis(10)));

        loop {
            if *self.role_tx.borrow() == Role::Candidate {
                match self
                    .namespace
                    .put_if_absent(&self.key, &self.candidate, Some(lease))
                    .await
                {
                    Ok(true) => self.set_role(Role::Leader),
                    Ok(false) => {}
                    Err(e) => return Term::Lost(e),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Term::Shutdown,
                _ = keep_alive.tick() => {
                    if let Err(e) = self.namespace.keep_alive(lease).await {
                        return Term::Lost(e);
                    }
                    if *self.role_tx.borrow() == Role::Leader {
                        match self.namespace.get(&self.key).await {
                            Ok(Some(holder)) if holder == self.candidate => {}
                            Ok(_) => {
                                return Term::Lost(ClusterError::Coordination(
                                    "election key taken over".to_string(),
                                ))
                            }
                            Err(e) => return Term::Lost(e),
                        }
                    }
                }
                event = watch.next() => {
                    if event.is_none() {
                        return Term::Lost(ClusterError::Coordination(
                            "election watch closed".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Election for LeaseElection {
    fn subscribe(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(candidate = %self.candidate, key = %self.key, "Joining master election");
        loop {
            let lost = match self.session(&shutdown).await {
                Ok(Term::Shutdown) => break,
                Ok(Term::Lost(e)) | Err(e) => e,
            };
            tracing::warn!(candidate = %self.candidate, error = %lost, "Election session lost");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(retry_delay(self.ttl / 10)) => {}
            }
        }
        self.set_role(Role::Candidate);
        tracing::info!(candidate = %self.candidate, "Left master election");
        Ok(())
    }
}
