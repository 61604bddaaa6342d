use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ClusterError, Result};

pub type LeaseId = u64;

/// Change notification for a key under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
    /// Events were dropped because the watcher fell behind.
    Resync,
}

impl WatchEvent {
    pub fn key(&self) -> Option<&str> {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => Some(key),
            WatchEvent::Resync => None,
        }
    }
}

/// Stream of events for keys starting with a prefix.
pub struct WatchStream {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl WatchStream {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// Next matching event; `None` once the namespace is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => match event.key() {
                    Some(key) if !key.starts_with(&self.prefix) => continue,
                    _ => return Some(event),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(prefix = %self.prefix, skipped, "Watch lagged");
                    return Some(WatchEvent::Resync);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Discard events that are already queued without waiting for more.
    /// Returns how many matching events were dropped.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if event.key().map_or(true, |key| key.starts_with(&self.prefix)) {
                        drained += 1;
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => drained += 1,
                Err(_) => return drained,
            }
        }
    }
}

/// Endpoint scheme served by [`MemoryNamespace`].
pub const MEMORY_SCHEME: &str = "memory";

/// Open the namespace named by the configured endpoints.
///
/// Every endpoint must be `memory://<name>` and all of them must name the
/// same namespace.
pub fn connect(endpoints: &[String]) -> Result<Arc<MemoryNamespace>> {
    let mut names = BTreeSet::new();
    for endpoint in endpoints.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        match endpoint.split_once("://") {
            Some((MEMORY_SCHEME, name)) => {
                names.insert(name);
            }
            _ => {
                return Err(ClusterError::Config(format!(
                    "unsupported coordination endpoint {}",
                    endpoint
                )))
            }
        }
    }
    let mut names = names.into_iter();
    match (names.next(), names.next()) {
        (None, _) => Err(ClusterError::Config(
            "no coordination endpoints configured".to_string(),
        )),
        (Some(name), None) => {
            tracing::info!(namespace = name, "Using in-process coordination namespace");
            Ok(Arc::new(MemoryNamespace::new()))
        }
        (Some(_), Some(_)) => Err(ClusterError::Config(
            "coordination endpoints name different namespaces".to_string(),
        )),
    }
}

/// Key/value store with prefix scan, prefix watch and lease-bound keys.
///
/// Keys attached to a lease disappear when the lease expires or is revoked.
#[async_trait]
pub trait Namespace: Send + Sync {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refresh a lease. Fails with [`ClusterError::LeaseExpired`] once it is gone.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Create `key` only if it does not exist. Returns whether it was created.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All pairs whose key starts with `prefix`, ordered by key.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;
}

#[derive(Debug)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseState {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease: LeaseId,
}

/// In-process [`Namespace`]. Expired leases are collected lazily on every
/// operation and, if [`spawn_reaper`](MemoryNamespace::spawn_reaper) is
/// running, periodically so that watchers see expirations promptly.
pub struct MemoryNamespace {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNamespace {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Drop expired leases and their keys now.
    pub async fn expire_leases(&self) {
        let mut state = self.state.lock().await;
        self.collect_expired(&mut state);
    }

    pub fn spawn_reaper(
        self: Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => self.expire_leases().await,
                }
            }
        })
    }

    fn collect_expired(&self, state: &mut State) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            tracing::debug!(lease = format!("{:x}", lease), "Lease expired");
            self.drop_lease(state, lease);
        }
    }

    fn drop_lease(&self, state: &mut State, lease: LeaseId) {
        state.leases.remove(&lease);
        let keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            state.entries.remove(&key);
            let _ = self.events.send(WatchEvent::Delete { key });
        }
    }

    fn check_lease(state: &State, lease: Option<LeaseId>) -> Result<()> {
        match lease {
            Some(id) if !state.leases.contains_key(&id) => Err(ClusterError::LeaseExpired(id)),
            _ => Ok(()),
        }
    }

    fn insert(&self, state: &mut State, key: &str, value: &str, lease: Option<LeaseId>) {
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        let _ = self.events.send(WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
}

#[async_trait]
impl Namespace for MemoryNamespace {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.state.lock().await;
        self.collect_expired(&mut state);
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock().await;
        self.collect_expired(&mut state);
        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(ClusterError::LeaseExpired(lease))?;
        entry.deadline = Instant::now() + entry.ttl;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock().await;
        self.collect_expired(&mut state);
        if !state.leases.contains_key(&lease) {
            return Err(ClusterError::LeaseExpired(lease));
        }
        self.drop_lease(&mut state, lease);
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut state = self.state.lock().await;
        self.collect_expired(&mut state);
        Self::check_lease(&state, lease)?;
        self.insert(&mut state, key, value, lease);
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.collect_expired(&mut state);
        Self::check_lease(&state, lease)?;
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        self.insert(&mut state, key, value, lease);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        self.collect_expired(&mut state);
        Ok(state.entries.get(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.collect_expired(&mut state);
        let existed = state.entries.remove(key).is_some();
        if existed {
            let _ = self.events.send(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(existed)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut state = self.state.lock().await;
        self.collect_expired(&mut state);
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        Ok(WatchStream::new(prefix, self.events.subscribe()))
    }
}
