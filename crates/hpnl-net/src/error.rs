use hpnl_types::{Address, BufferId, EventQueueHandle, RemoteKey};
use thiserror::Error;

use crate::memory::BufferRole;

/// Errors reported by a transport provider.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Another passive endpoint already listens on the address.
    #[error("address {0} already in use")]
    AddressInUse(Address),

    /// The provider could not create a passive endpoint.
    #[error("cannot bind {addr}: {reason}")]
    Bind { addr: Address, reason: String },

    /// The peer actively rejected the connection request.
    #[error("connection to {0} refused")]
    ConnectionRefused(Address),

    #[error("unknown event queue {0:?}")]
    UnknownEventQueue(EventQueueHandle),

    /// The event queue exists but has no connected peer (passive or torn down).
    #[error("event queue {0:?} is not connected")]
    NotConnected(EventQueueHandle),

    /// The provider declined a memory registration (e.g. resource exhaustion).
    #[error("memory registration failed: {0}")]
    Registration(String),

    #[error("{role} buffer {id} is not registered")]
    UnknownBuffer { role: BufferRole, id: BufferId },

    #[error("unknown remote key {0}")]
    UnknownRemoteKey(RemoteKey),

    /// A remote access fell outside the registered region.
    #[error("remote access [{addr:#x}, +{len}) is outside the registered region")]
    OutOfBounds { addr: u64, len: u64 },

    /// A message does not fit into the buffer it would be copied to.
    #[error("message of {len} bytes exceeds buffer capacity of {capacity} bytes")]
    MessageTooLarge { len: usize, capacity: usize },

    /// Unrecoverable provider failure; the event loop cannot continue.
    #[error("fatal transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether the provider is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Fatal(_))
    }
}
