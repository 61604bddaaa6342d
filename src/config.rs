use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ClusterError, Result};

/// Master cycle interval used when none is configured.
pub const DEFAULT_MASTER_INTERVAL: Duration = Duration::from_secs(60);
/// Worker pacing used when none is configured.
pub const DEFAULT_SERVANT_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Coordination store endpoints, resolved by
    /// [`coordination::connect`](crate::coordination::connect)
    pub coordination_endpoints: Vec<String>,
    /// Namespace prefix, e.g. `/servant-cluster`
    pub prefix: String,
    /// Host part of the address other nodes use to reach this one
    pub advertise_host: String,
    /// RPC listen address; port 0 picks a free port
    pub listen_addr: SocketAddr,
    pub max_workers: usize,
    /// Zero falls back to [`DEFAULT_MASTER_INTERVAL`]
    pub master_schedule_interval: Duration,
    /// Zero falls back to [`DEFAULT_SERVANT_INTERVAL`]
    pub servant_interval: Duration,
    /// Lease TTL of the servant registration entry
    pub session_ttl: Duration,
    pub election_ttl: Duration,
    /// Delay before re-registering after a lost session
    pub registration_retry: Duration,
    /// Per-call timeout of master to servant RPCs. None relies on the
    /// transport.
    pub rpc_timeout: Option<Duration>,
    pub dashboard_addr: Option<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            coordination_endpoints: vec!["memory://local".to_string()],
            prefix: "/servant-cluster".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_workers: 8,
            master_schedule_interval: DEFAULT_MASTER_INTERVAL,
            servant_interval: DEFAULT_SERVANT_INTERVAL,
            session_ttl: Duration::from_secs(10),
            election_ttl: Duration::from_secs(15),
            registration_retry: Duration::from_secs(1),
            rpc_timeout: None,
            dashboard_addr: None,
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_master_interval(mut self, interval: Duration) -> Self {
        self.master_schedule_interval = interval;
        self
    }

    pub fn with_servant_interval(mut self, interval: Duration) -> Self {
        self.servant_interval = interval;
        self
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    /// Check required fields, trim the prefix and substitute defaults for
    /// zero intervals.
    pub fn validate(mut self) -> Result<Self> {
        if self.coordination_endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(ClusterError::Config(
                "no coordination endpoints configured".to_string(),
            ));
        }
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return Err(ClusterError::Config("namespace prefix is empty".to_string()));
        }
        self.prefix = prefix.to_string();
        if self.advertise_host.trim().is_empty() {
            return Err(ClusterError::Config("advertise host is empty".to_string()));
        }
        if self.max_workers == 0 {
            return Err(ClusterError::Config(
                "max workers must be positive".to_string(),
            ));
        }
        if self.session_ttl.is_zero() || self.election_ttl.is_zero() {
            return Err(ClusterError::Config("lease TTLs must be positive".to_string()));
        }
        if self.master_schedule_interval.is_zero() {
            self.master_schedule_interval = DEFAULT_MASTER_INTERVAL;
        }
        if self.servant_interval.is_zero() {
            self.servant_interval = DEFAULT_SERVANT_INTERVAL;
        }
        Ok(self)
    }

    /// Address registered for this servant once the listener is bound.
    pub fn servant_address(&self, port: u16) -> String {
        format!("{}:{}", self.advertise_host, port)
    }
}
