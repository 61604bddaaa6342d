use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::coordination::keys::servant_entry_key;
use crate::coordination::{LeaseId, Namespace};
use crate::error::Result;

/// Keeps this servant's membership entry alive under a session lease.
///
/// The entry is `<prefix>/servants/<lease-hex>/<address>` with the address as
/// value. It disappears with the lease if the process dies and is deleted
/// explicitly on shutdown. A lost session is re-registered after `retry`.
pub struct Registration {
    namespace: Arc<dyn Namespace>,
    prefix: String,
    address: String,
    ttl: Duration,
    retry: Duration,
    reschedule: Arc<Notify>,
}

enum SessionEnd {
    Shutdown,
    Lost,
}

impl Registration {
    pub fn new(
        namespace: Arc<dyn Namespace>,
        prefix: impl Into<String>,
        address: impl Into<String>,
        ttl: Duration,
        retry: Duration,
        reschedule: Arc<Notify>,
    ) -> Self {
        Self {
            namespace,
            prefix: prefix.into(),
            address: address.into(),
            ttl,
            retry,
            reschedule,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            match self.session(&shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Lost) => {
                    tracing::warn!(address = %self.address, "Registration session lost");
                }
                Err(e) => {
                    tracing::warn!(address = %self.address, error = %e, "Registration failed");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.retry) => {}
            }
        }
        tracing::info!(address = %self.address, "Servant deregistered");
    }

    async fn session(&self, shutdown: &CancellationToken) -> Result<SessionEnd> {
        let lease = self.namespace.grant_lease(self.ttl).await?;
        let key = servant_entry_key(&self.prefix, lease, &self.address);
        if let Err(e) = self.namespace.put(&key, &self.address, Some(lease)).await {
            self.revoke(lease).await;
            return Err(e);
        }
        tracing::info!(key = %key, "Servant registered");

        let end = self.hold(lease, &key, shutdown).await;
        if let SessionEnd::Shutdown = end {
            if let Err(e) = self.namespace.delete(&key).await {
                tracing::debug!(key = %key, error = %e, "Deregistration failed");
            }
            self.revoke(lease).await;
        }
        Ok(end)
    }

    async fn revoke(&self, lease: LeaseId) {
        if let Err(e) = self.namespace.revoke_lease(lease).await {
            tracing::debug!(lease = format!("{:x}", lease), error = %e, "Lease revoke failed");
        }
    }

    async fn hold(&self, lease: LeaseId, key: &str, shutdown: &CancellationToken) -> SessionEnd {
        let mut keep_alive = tokio::time::interval((self.ttl / 3).max(Duration::from_millis(10)));
        keep_alive.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                _ = self.reschedule.notified() => {
                    // Rewriting the entry wakes the master's membership watch.
                    if let Err(e) = self.namespace.put(key, &self.address, Some(lease)).await {
                        tracing::warn!(key = %key, error = %e, "Reschedule request failed");
                        return SessionEnd::Lost;
                    }
                    tracing::debug!(key = %key, "Requested master reschedule");
                }
                _ = keep_alive.tick() => {
                    if let Err(e) = self.namespace.keep_alive(lease).await {
                        tracing::debug!(key = %key, error = %e, "Keep-alive failed");
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }
}
