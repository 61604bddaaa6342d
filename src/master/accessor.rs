use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use crate::coordination::keys::{servant_address_from_key, servants_key};
use crate::coordination::{Namespace, WatchStream};
use crate::error::{ClusterError, Result};
use crate::proto::ticket_dispatcher_client::TicketDispatcherClient;
use crate::proto::{Empty, TicketsInfo};
use crate::tickets::TicketSet;

/// Servant membership as seen through the coordination namespace.
#[derive(Clone)]
pub struct ServantDirectory {
    namespace: Arc<dyn Namespace>,
    servants_prefix: String,
}

impl ServantDirectory {
    pub fn new(namespace: Arc<dyn Namespace>, prefix: &str) -> Self {
        Self {
            namespace,
            servants_prefix: format!("{}/", servants_key(prefix)),
        }
    }

    /// Addresses of all registered servants in key order. An address
    /// registered under several leases is reported once.
    pub async fn list_servants(&self) -> Result<Vec<String>> {
        let entries = self
            .namespace
            .list_prefix(&self.servants_prefix)
            .await
            .map_err(|e| ClusterError::Membership(e.to_string()))?;

        let mut servants: Vec<String> = Vec::with_capacity(entries.len());
        for (key, _) in entries {
            let address = servant_address_from_key(&key);
            if !address.is_empty() && !servants.iter().any(|s| s == address) {
                servants.push(address.to_string());
            }
        }
        Ok(servants)
    }

    /// Change notifications for the servant subtree.
    pub async fn watch(&self) -> Result<WatchStream> {
        self.namespace
            .watch_prefix(&self.servants_prefix)
            .await
            .map_err(|e| ClusterError::Membership(e.to_string()))
    }
}

/// Fetch/push contract the master uses to talk to servants.
#[async_trait]
pub trait ServantRpc: Send + Sync {
    /// Current held set and optional stats blob of `servant`.
    async fn fetch(&self, servant: &str) -> Result<(TicketSet, Option<Vec<u8>>)>;

    /// Replace the held set of `servant`.
    async fn push(&self, servant: &str, tickets: &TicketSet) -> Result<()>;
}

/// [`ServantRpc`] over the tonic `TicketDispatcher` client.
pub struct GrpcServantRpc {
    timeout: Option<Duration>,
    /// Connections keyed by servant address
    clients: Mutex<HashMap<String, TicketDispatcherClient<Channel>>>,
}

impl GrpcServantRpc {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn create_channel(&self, servant: &str) -> Result<Channel> {
        let mut endpoint = Endpoint::from_shared(format!("http://{}", servant))
            .map_err(|e| ClusterError::servant_rpc(servant, format!("invalid endpoint: {}", e)))?;
        if let Some(timeout) = self.timeout {
            endpoint = endpoint.timeout(timeout).connect_timeout(timeout);
        }
        endpoint
            .connect()
            .await
            .map_err(|e| ClusterError::servant_rpc(servant, format!("connect failed: {}", e)))
    }

    async fn client(&self, servant: &str) -> Result<TicketDispatcherClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(servant) {
            return Ok(client.clone());
        }
        let client = TicketDispatcherClient::new(self.create_channel(servant).await?);
        clients.insert(servant.to_string(), client.clone());
        Ok(client)
    }

    /// Drop a cached connection so the next call reconnects.
    async fn evict(&self, servant: &str) {
        self.clients.lock().await.remove(servant);
    }
}

#[async_trait]
impl ServantRpc for GrpcServantRpc {
    async fn fetch(&self, servant: &str) -> Result<(TicketSet, Option<Vec<u8>>)> {
        let mut client = self.client(servant).await?;
        let response = match client.get_tickets(Empty {}).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                self.evict(servant).await;
                return Err(ClusterError::servant_rpc(servant, status.message()));
            }
        };
        let tickets = response.to_ticket_set()?;
        let stats = response.sys_info.map(|info| info.stats);
        Ok((tickets, stats))
    }

    async fn push(&self, servant: &str, tickets: &TicketSet) -> Result<()> {
        let mut client = self.client(servant).await?;
        if let Err(status) = client.set_tickets(TicketsInfo::from_tickets(tickets)).await {
            self.evict(servant).await;
            return Err(ClusterError::servant_rpc(servant, status.message()));
        }
        Ok(())
    }
}
