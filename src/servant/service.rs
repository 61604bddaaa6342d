use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::error::{ClusterError, HandlerError};
use crate::proto::ticket_dispatcher_server::TicketDispatcher;
use crate::proto::{Empty, SystemInfo, TicketsInfo};
use crate::tickets::TicketQueue;

/// Optional producer of the freeform stats blob returned with `GetTickets`.
pub trait StatsFetcher: Send + Sync {
    fn stats(&self) -> Result<Vec<u8>, HandlerError>;
}

impl<F> StatsFetcher for F
where
    F: Fn() -> Result<Vec<u8>, HandlerError> + Send + Sync,
{
    fn stats(&self) -> Result<Vec<u8>, HandlerError> {
        self()
    }
}

impl From<ClusterError> for Status {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::ConcurrentSet => Status::aborted(err.to_string()),
            ClusterError::InvalidTicket(_) => Status::invalid_argument(err.to_string()),
            ClusterError::Rpc(status) => status,
            other => Status::internal(other.to_string()),
        }
    }
}

/// Servant side of the `TicketDispatcher` RPC: exposes the local queue to
/// the master.
pub struct TicketService {
    queue: Arc<TicketQueue>,
    stats: Option<Arc<dyn StatsFetcher>>,
}

impl TicketService {
    pub fn new(queue: Arc<TicketQueue>, stats: Option<Arc<dyn StatsFetcher>>) -> Self {
        Self { queue, stats }
    }
}

#[tonic::async_trait]
impl TicketDispatcher for TicketService {
    async fn get_tickets(&self, _request: Request<Empty>) -> Result<Response<TicketsInfo>, Status> {
        let mut info = TicketsInfo::from_tickets(&self.queue.get());
        if let Some(fetcher) = &self.stats {
            let stats = fetcher
                .stats()
                .map_err(|e| Status::internal(format!("Stats unavailable: {}", e)))?;
            info.sys_info = Some(SystemInfo { stats });
        }
        Ok(Response::new(info))
    }

    async fn set_tickets(&self, request: Request<TicketsInfo>) -> Result<Response<Empty>, Status> {
        let tickets = request.into_inner().to_ticket_set()?;
        let count = tickets.len();
        self.queue.set(tickets)?;
        tracing::debug!(tickets = count, "Accepted ticket assignment");
        Ok(Response::new(Empty {}))
    }
}
