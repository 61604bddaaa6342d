pub mod config;
pub mod coordination;
pub mod dashboard;
pub mod error;
pub mod master;
pub mod node;
pub mod proto;
pub mod servant;
pub mod shutdown;
pub mod tickets;

pub use error::{ClusterError, Result};
