use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::coordination::keys::master_key;
use crate::coordination::{self, Election, LeaseElection, Namespace, Role};
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::{ClusterError, Result};
use crate::master::{DispatchPolicy, GrpcServantRpc, Master, ServantDirectory, ServantRpc};
use crate::proto::ticket_dispatcher_server::TicketDispatcherServer;
use crate::servant::{Registration, ServantPool, StatsFetcher, TicketHandler, TicketService};
use crate::tickets::TicketQueue;

/// Collects configuration and extension points for a [`Node`].
pub struct NodeBuilder {
    config: NodeConfig,
    namespace: Option<Arc<dyn Namespace>>,
    policy: Option<Arc<dyn DispatchPolicy>>,
    handler: Option<Arc<dyn TicketHandler>>,
    stats: Option<Arc<dyn StatsFetcher>>,
    rpc: Option<Arc<dyn ServantRpc>>,
    election: Option<Arc<dyn Election>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            namespace: None,
            policy: None,
            handler: None,
            stats: None,
            rpc: None,
            election: None,
        }
    }

    pub fn namespace(mut self, namespace: Arc<dyn Namespace>) -> Self {
        self.namespace = Some(namespace);
        self
    }

    pub fn dispatch_policy(mut self, policy: Arc<dyn DispatchPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn ticket_handler(mut self, handler: Arc<dyn TicketHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn stats_fetcher(mut self, stats: Arc<dyn StatsFetcher>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Replace the gRPC client the master uses to reach servants.
    pub fn servant_rpc(mut self, rpc: Arc<dyn ServantRpc>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    /// Replace the lease election on `<prefix>/master`.
    pub fn election(mut self, election: Arc<dyn Election>) -> Self {
        self.election = Some(election);
        self
    }

    pub fn build(self) -> Result<Node> {
        let config = self.config.validate()?;
        let namespace: Arc<dyn Namespace> = match self.namespace {
            Some(namespace) => namespace,
            None => coordination::connect(&config.coordination_endpoints)?,
        };
        let policy = self
            .policy
            .ok_or_else(|| ClusterError::Config("no dispatch policy".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| ClusterError::Config("no ticket handler".to_string()))?;

        Ok(Node {
            config,
            namespace,
            policy,
            handler,
            stats: self.stats,
            rpc: self.rpc,
            election: self.election,
        })
    }
}

/// A validated node, ready to start. Every node is both a servant and a
/// master candidate.
pub struct Node {
    config: NodeConfig,
    namespace: Arc<dyn Namespace>,
    policy: Arc<dyn DispatchPolicy>,
    handler: Arc<dyn TicketHandler>,
    stats: Option<Arc<dyn StatsFetcher>>,
    rpc: Option<Arc<dyn ServantRpc>>,
    election: Option<Arc<dyn Election>>,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Start all node components.
    ///
    /// 1. Binds the RPC listener and serves `TicketDispatcher`
    /// 2. Joins the master election and runs the dispatch loop while leader
    /// 3. Starts the servant pool on the local ticket queue
    /// 4. Registers the servant address in the namespace
    /// 5. Optionally serves the dashboard
    ///
    /// # Errors
    ///
    /// Fails if the listener cannot be bound. Later failures are logged by
    /// the component that hit them.
    pub async fn start(self) -> Result<RunningNode> {
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let address = self.config.servant_address(local_addr.port());
        let shutdown = CancellationToken::new();
        let queue = Arc::new(TicketQueue::new());

        let service = TicketService::new(queue.clone(), self.stats.clone());
        let server = {
            let token = shutdown.clone();
            tokio::spawn(async move {
                tonic::transport::Server::builder()
                    .add_service(TicketDispatcherServer::new(service))
                    .serve_with_incoming_shutdown(
                        TcpListenerStream::new(listener),
                        token.cancelled_owned(),
                    )
                    .await
            })
        };
        tracing::info!(address = %address, listen = %local_addr, "Servant RPC listening");

        let election: Arc<dyn Election> = match self.election.clone() {
            Some(election) => election,
            None => Arc::new(LeaseElection::new(
                self.namespace.clone(),
                master_key(&self.config.prefix),
                Uuid::new_v4().to_string(),
                self.config.election_ttl,
            )),
        };
        let rpc: Arc<dyn ServantRpc> = match self.rpc.clone() {
            Some(rpc) => rpc,
            None => Arc::new(GrpcServantRpc::new(self.config.rpc_timeout)),
        };
        let master = Arc::new(Master::new(
            election,
            ServantDirectory::new(self.namespace.clone(), &self.config.prefix),
            rpc,
            self.policy.clone(),
            self.config.master_schedule_interval,
        ));

        let mut tasks = Vec::new();
        tasks.push({
            let master = master.clone();
            let token = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = master.run(token).await {
                    tracing::error!(error = %e, "Master exited with error");
                }
            })
        });

        let pool = ServantPool::start(
            queue.clone(),
            self.handler.clone(),
            self.config.max_workers,
            self.config.servant_interval,
            shutdown.child_token(),
        );

        let registration = Registration::new(
            self.namespace.clone(),
            self.config.prefix.clone(),
            address.clone(),
            self.config.session_ttl,
            self.config.registration_retry,
            pool.reschedule_signal(),
        );
        tasks.push({
            let token = shutdown.child_token();
            tokio::spawn(async move { registration.run(token).await })
        });

        if let Some(dashboard_addr) = self.config.dashboard_addr {
            let state = DashboardState {
                address: address.clone(),
                queue: queue.clone(),
                pool: pool.clone(),
                master: master.clone(),
            };
            let token = shutdown.child_token();
            tasks.push(tokio::spawn(async move {
                run_dashboard(dashboard_addr, state, token).await;
            }));
        }

        tracing::info!(address = %address, "Node started");
        Ok(RunningNode {
            address,
            queue,
            pool,
            master,
            shutdown,
            stopped: AtomicBool::new(false),
            server: Mutex::new(Some(server)),
            tasks: Mutex::new(tasks),
        })
    }
}

/// Handle to a started node.
pub struct RunningNode {
    address: String,
    queue: Arc<TicketQueue>,
    pool: Arc<ServantPool>,
    master: Arc<Master>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    server: Mutex<Option<JoinHandle<std::result::Result<(), tonic::transport::Error>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RunningNode {
    /// Advertised servant address, `host:port`.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn queue(&self) -> &Arc<TicketQueue> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<ServantPool> {
        &self.pool
    }

    pub fn master(&self) -> &Arc<Master> {
        &self.master
    }

    pub fn role(&self) -> Role {
        self.master.role()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn dashboard_state(&self) -> DashboardState {
        DashboardState {
            address: self.address.clone(),
            queue: self.queue.clone(),
            pool: self.pool.clone(),
            master: self.master.clone(),
        }
    }

    /// Deregister, stop the workers, leave the election and stop serving.
    /// Only the first call does anything.
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(address = %self.address, "Shutting down node");
        self.shutdown.cancel();

        self.pool.stop().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Node task panicked");
            }
        }

        let server = self.server.lock().await.take();
        if let Some(server) = server {
            match server.await {
                Ok(result) => result?,
                Err(e) => tracing::error!(error = %e, "RPC server task panicked"),
            }
        }
        tracing::info!(address = %self.address, "Node stopped");
        Ok(())
    }
}
