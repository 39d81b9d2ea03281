use hpnl_net::{BufferRole, TransportError};
use hpnl_types::{Address, BufferId, EventQueueHandle};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the management layer.
#[derive(Debug, Error)]
pub enum HpnlError {
    /// The transport could not create a passive endpoint on the address.
    #[error("cannot listen on {addr}: {source}")]
    BindFailure {
        addr: Address,
        #[source]
        source: TransportError,
    },

    /// No CONNECTED event arrived within the caller's timeout.
    #[error("connect to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout { addr: Address, timeout_ms: u64 },

    /// The transport rejected the connection request outright.
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: Address,
        #[source]
        source: TransportError,
    },

    #[error("cannot register {role} buffer {id}: {source}")]
    RegistrationFailure {
        role: BufferRole,
        id: BufferId,
        #[source]
        source: TransportError,
    },

    /// Every buffer of the pool is checked out.
    #[error("{0} buffer pool exhausted")]
    BufferPoolExhausted(BufferRole),

    #[error("{role} pool has no buffer {id}")]
    InvalidBufferId { role: BufferRole, id: BufferId },

    #[error("{role} buffer {id} released while not checked out")]
    DoubleRelease { role: BufferRole, id: BufferId },

    /// The polling loop stopped on a fatal transport error.
    #[error("event loop terminated: {0}")]
    LoopTerminated(String),

    #[error("connection on {0} is not connected")]
    NotConnected(EventQueueHandle),

    #[error("payload of {len} bytes does not fit a {capacity}-byte buffer with header")]
    PayloadTooLarge { len: usize, capacity: usize },

    /// A frame length outside `[header size, capacity]`.
    #[error("invalid frame length {len} for a {capacity}-byte buffer")]
    InvalidLength { len: usize, capacity: usize },

    /// The operation is not available for this buffer role or service role.
    #[error("operation not permitted: {0}")]
    WrongRole(&'static str),

    #[error("event loop is not running")]
    NotRunning,

    #[error("event loop is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HpnlError {
    /// Misuse of the API, as opposed to a condition of the transport or peer.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            HpnlError::InvalidBufferId { .. }
                | HpnlError::DoubleRelease { .. }
                | HpnlError::WrongRole(_)
                | HpnlError::AlreadyRunning
        )
    }
}

pub type Result<T, E = HpnlError> = std::result::Result<T, E>;
