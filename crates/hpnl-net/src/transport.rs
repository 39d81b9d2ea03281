use std::sync::Arc;
use std::time::Duration;

use hpnl_types::{Address, BufferId, ConnectionHandle, EventQueueHandle, RemoteKey};

use crate::error::TransportError;
use crate::event::Completion;
use crate::memory::{BufferRole, MemoryRegion, RemoteBuffer};

/// Addressing facts about a connected event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub handle: ConnectionHandle,
    pub local: Address,
    pub peer: Address,
}

/// A completion-queue based transport provider.
///
/// Every method is blocking-safe and may be called from the single polling
/// thread as well as from application threads. Buffers are referred to by
/// `(role, id)` after [`Transport::register_buffer`]; the provider keeps the
/// region alive until [`Transport::deregister_buffer`].
pub trait Transport: Send + Sync + 'static {
    /// Create a passive endpoint on `addr`. Incoming connections are reported
    /// as [`Completion::Accepted`] on the returned queue.
    fn listen(&self, addr: Address) -> Result<EventQueueHandle, TransportError>;

    /// Create an active endpoint and start connecting to `addr`.
    ///
    /// Returns as soon as the request is issued; the handshake finishes with a
    /// `Connected` completion on the returned queue, if it ever does.
    fn connect(&self, addr: Address) -> Result<EventQueueHandle, TransportError>;

    /// Connection handle and addresses of a connected queue.
    fn connection_info(&self, eq: EventQueueHandle) -> Result<ConnectionInfo, TransportError>;

    /// Wait up to `timeout` for completions on any of `eqs` and append at most
    /// `max` of them to `out`, preserving per-queue order. Returning with
    /// nothing appended means the timeout elapsed.
    fn poll(
        &self,
        eqs: &[EventQueueHandle],
        timeout: Duration,
        max: usize,
        out: &mut Vec<Completion>,
    ) -> Result<(), TransportError>;

    /// Register a region under `(role, id)`.
    fn register_buffer(
        &self,
        role: BufferRole,
        id: BufferId,
        region: Arc<MemoryRegion>,
    ) -> Result<RemoteKey, TransportError>;

    fn deregister_buffer(&self, role: BufferRole, id: BufferId) -> Result<(), TransportError>;

    /// Post a registered receive buffer on a connected queue.
    fn post_recv(&self, eq: EventQueueHandle, id: BufferId) -> Result<(), TransportError>;

    /// Send the first `len` bytes of a registered send buffer.
    fn post_send(&self, eq: EventQueueHandle, id: BufferId, len: usize)
        -> Result<(), TransportError>;

    /// Read `remote.len` bytes from a peer's registered region into the
    /// local RMA buffer `local`.
    fn post_read(
        &self,
        eq: EventQueueHandle,
        local: BufferId,
        remote: &RemoteBuffer,
    ) -> Result<(), TransportError>;

    /// Release an event queue. A connected peer observes `Shutdown`.
    fn destroy(&self, eq: EventQueueHandle) -> Result<(), TransportError>;
}
