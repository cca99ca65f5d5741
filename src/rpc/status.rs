//! Error and status taxonomy surfaced to `Client`/`Server` callers.
//!
//! Grounded on spec §7: a small closed set of outcomes, with setup-time
//! failures propagated directly and datapath failures latched on the
//! context and handed back from `call`.

use thiserror::Error;

use crate::rdma::cq::CqCreationError;
use crate::rdma::nic::NicProbeError;
use crate::rdma::qp::QpCreationError;

/// The crate's error taxonomy.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Invalid host/port, memory-region registration failure, queue-pair
    /// creation failure, or any other failure at connection setup time.
    /// Fatal: propagated directly from `new`/`connect`/`listen`.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Request serialized size plus header size exceeds the page size.
    /// Returned from `call` before any verb is posted.
    #[error("message of {len} bytes (+ header) exceeds page size {page_size}")]
    MessageTooLarge { len: usize, page_size: usize },

    /// A non-success work-completion occurred during a call. The context
    /// has already been returned to `Vacant`.
    #[error("RDMA work-completion failed: {0}")]
    CallFailure(String),

    /// The peer disconnected while a call was outstanding on its
    /// connection.
    #[error("peer disconnected")]
    PeerDisconnected,
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::ConfigError(e.to_string())
    }
}

impl From<QpCreationError> for RpcError {
    fn from(e: QpCreationError) -> Self {
        RpcError::ConfigError(e.to_string())
    }
}

impl From<CqCreationError> for RpcError {
    fn from(e: CqCreationError) -> Self {
        RpcError::ConfigError(e.to_string())
    }
}

impl From<NicProbeError> for RpcError {
    fn from(e: NicProbeError) -> Self {
        RpcError::ConfigError(e.to_string())
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(e: anyhow::Error) -> Self {
        RpcError::ConfigError(e.to_string())
    }
}

/// Result alias used throughout the RPC runtime.
pub type RpcStatus<T> = Result<T, RpcError>;
