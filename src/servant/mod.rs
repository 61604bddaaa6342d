//! Servant side of the cluster.
//!
//! A servant holds the tickets the master assigned to it in a
//! [`TicketQueue`](crate::tickets::TicketQueue), drains them with a pool of
//! workers sized to the ticket count, serves the `TicketDispatcher` RPC and
//! keeps its membership entry alive in the coordination namespace.

pub mod pool;
pub mod registration;
pub mod service;
pub mod worker;

pub use pool::{ServantPool, WorkerInfo};
pub use registration::Registration;
pub use service::{StatsFetcher, TicketService};
pub use worker::{TicketHandler, WorkerHandle, WorkerState};
