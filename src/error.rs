use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Bad config: {0}")]
    Config(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Lease {0:x} expired or unknown")]
    LeaseExpired(u64),

    #[error("Membership enumeration failed: {0}")]
    Membership(String),

    #[error("Servant {servant} RPC failed: {message}")]
    ServantRpc { servant: String, message: String },

    #[error("Concurrent set on ticket queue, retry with a fresh read")]
    ConcurrentSet,

    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("gRPC error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn servant_rpc(servant: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::ServantRpc {
            servant: servant.into(),
            message: message.to_string(),
        }
    }
}

/// Error returned by caller-supplied ticket handlers and stats fetchers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, ClusterError>;
