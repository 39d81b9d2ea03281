//! Per-peer connection state and completion dispatch.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use hpnl_net::{BufferRole, ConnectionInfo, EventKind, RemoteBuffer, TransportError};
use hpnl_types::{Address, BufferId, ConnectionHandle, EventQueueHandle};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};

use crate::buffer::MemoryBuffer;
use crate::error::{HpnlError, Result};
use crate::reap::ReapQueue;
use crate::service::ServiceContext;

/// Completion callback: the connection, the buffer involved and the byte count.
/// `Connected` and `Shutdown` carry buffer id 0 and length 0.
pub type Handler = Arc<dyn Fn(&Arc<Connection>, BufferId, usize) + Send + Sync>;

/// One handler slot per [`EventKind`].
#[derive(Clone, Default)]
pub struct Handlers {
    connected: Option<Handler>,
    received: Option<Handler>,
    sent: Option<Handler>,
    read: Option<Handler>,
    shutdown: Option<Handler>,
}

impl Handlers {
    pub fn get(&self, kind: EventKind) -> Option<&Handler> {
        match kind {
            EventKind::Connected => self.connected.as_ref(),
            EventKind::Received => self.received.as_ref(),
            EventKind::Sent => self.sent.as_ref(),
            EventKind::Read => self.read.as_ref(),
            EventKind::Shutdown => self.shutdown.as_ref(),
        }
    }

    pub fn set(&mut self, kind: EventKind, handler: Option<Handler>) {
        let slot = match kind {
            EventKind::Connected => &mut self.connected,
            EventKind::Received => &mut self.received,
            EventKind::Sent => &mut self.sent,
            EventKind::Read => &mut self.read,
            EventKind::Shutdown => &mut self.shutdown,
        };
        *slot = handler;
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<EventKind> = EventKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind).is_some())
            .collect();
        f.debug_struct("Handlers").field("set", &set).finish()
    }
}

/// Lifecycle of a [`Connection`].
///
/// `Connecting -> Connected -> ShuttingDown -> Closed`; only a connection that
/// never connected may go straight from `Connecting` to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    ShuttingDown = 2,
    Closed = 3,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            ConnectionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// An established relationship with one peer.
///
/// Created by the service on the first `Connected` completion of an event
/// queue and destroyed only by the reaper after [`Connection::shutdown`].
pub struct Connection {
    eq: EventQueueHandle,
    info: ConnectionInfo,
    state: AtomicU8,
    handlers: RwLock<Handlers>,
    send_buffers: Mutex<HashSet<BufferId>>,
    recv_buffers: Mutex<HashSet<BufferId>>,
    dispatch_guard: ReentrantMutex<()>,
    ctx: Arc<ServiceContext>,
    reap: Arc<ReapQueue>,
}

impl Connection {
    pub(crate) fn new(
        eq: EventQueueHandle,
        info: ConnectionInfo,
        ctx: Arc<ServiceContext>,
        reap: Arc<ReapQueue>,
    ) -> Self {
        Self {
            eq,
            info,
            state: AtomicU8::new(ConnectionState::Connecting.into()),
            handlers: RwLock::new(Handlers::default()),
            send_buffers: Mutex::new(HashSet::new()),
            recv_buffers: Mutex::new(HashSet::new()),
            dispatch_guard: ReentrantMutex::new(()),
            ctx,
            reap,
        }
    }

    pub fn event_queue(&self) -> EventQueueHandle {
        self.eq
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.info.handle
    }

    /// Connection id stamped into outgoing frame headers.
    pub fn id(&self) -> u64 {
        self.info.handle.raw()
    }

    pub fn local_addr(&self) -> Address {
        self.info.local
    }

    pub fn peer_addr(&self) -> Address {
        self.info.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Replace the handler for `kind`. Affects completions dispatched after
    /// the call returns.
    pub fn assign_callback<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Arc<Connection>, BufferId, usize) + Send + Sync + 'static,
    {
        self.handlers.write().set(kind, Some(Arc::new(handler)));
    }

    pub fn clear_callback(&self, kind: EventKind) {
        self.handlers.write().set(kind, None);
    }

    pub(crate) fn install_handlers(&self, handlers: Handlers) {
        *self.handlers.write() = handlers;
    }

    pub(crate) fn handler(&self, kind: EventKind) -> Option<Handler> {
        self.handlers.read().get(kind).cloned()
    }

    /// Held while completions are dispatched and while the connection is reaped.
    pub(crate) fn dispatch_guard(&self) -> ReentrantMutexGuard<'_, ()> {
        self.dispatch_guard.lock()
    }

    fn is_closing(&self) -> bool {
        self.state() >= ConnectionState::ShuttingDown
    }

    /// Check out a free send buffer for this connection. Fails with
    /// `NotConnected` once the connection is shutting down.
    pub fn take_send_buffer(&self) -> Result<Arc<MemoryBuffer>> {
        if self.is_closing() {
            return Err(HpnlError::NotConnected(self.eq));
        }
        let buffer = self.ctx.send_pool.checkout()?;
        let id = buffer.id();
        buffer.set_connection_id(self.id());
        self.send_buffers.lock().insert(id);
        // A reap that began after the check above may have drained the set
        // already; whoever removes the id returns it to the pool.
        if self.is_closing() {
            if self.send_buffers.lock().remove(&id) {
                self.ctx.send_pool.release(id)?;
            }
            return Err(HpnlError::NotConnected(self.eq));
        }
        Ok(buffer)
    }

    /// Return a buffer obtained from [`take_send_buffer`](Self::take_send_buffer).
    pub fn put_send_buffer(&self, id: BufferId) -> Result<()> {
        if !self.send_buffers.lock().remove(&id) {
            self.ctx.send_pool.acquire(id)?;
            return Err(HpnlError::DoubleRelease {
                role: BufferRole::Send,
                id,
            });
        }
        self.ctx.send_pool.release(id)
    }

    /// Send buffers currently held by this connection, in flight or not.
    pub fn send_buffer_count(&self) -> usize {
        self.send_buffers.lock().len()
    }

    /// Receive buffers posted on this connection.
    pub fn posted_recv_count(&self) -> usize {
        self.recv_buffers.lock().len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(HpnlError::NotConnected(self.eq))
        }
    }

    fn map_post_error(&self, err: TransportError) -> HpnlError {
        match err {
            TransportError::NotConnected(_) | TransportError::UnknownEventQueue(_) => {
                HpnlError::NotConnected(self.eq)
            }
            other => HpnlError::Transport(other),
        }
    }

    /// Post the first `len` bytes of a taken send buffer. The buffer returns to
    /// the pool after the `Sent` completion has been dispatched.
    pub fn send(&self, buffer_id: BufferId, len: usize) -> Result<()> {
        self.ensure_connected()?;
        if !self.send_buffers.lock().contains(&buffer_id) {
            return Err(HpnlError::InvalidBufferId {
                role: BufferRole::Send,
                id: buffer_id,
            });
        }
        let capacity = self.ctx.send_pool.buffer_size();
        if len > capacity {
            return Err(HpnlError::InvalidLength { len, capacity });
        }
        self.ctx
            .transport
            .post_send(self.eq, buffer_id, len)
            .map_err(|e| self.map_post_error(e))?;
        tracing::trace!(eq = %self.eq, buffer = %buffer_id, len, "send posted");
        Ok(())
    }

    /// Frame `payload` into a fresh send buffer and post it.
    pub fn send_frame(&self, frame_type: u8, seq: u64, payload: &[u8]) -> Result<BufferId> {
        let buffer = self.take_send_buffer()?;
        let posted = buffer
            .put_data(frame_type, seq, payload)
            .and_then(|len| self.send(buffer.id(), len));
        if let Err(err) = posted {
            self.put_send_buffer(buffer.id())?;
            return Err(err);
        }
        Ok(buffer.id())
    }

    /// Read `len` bytes of `remote` into the local RMA buffer `local`.
    pub fn read(&self, local: BufferId, remote: &RemoteBuffer, len: usize) -> Result<()> {
        self.ensure_connected()?;
        let target = self.ctx.rma_pool.acquire(local)?;
        if len > target.capacity() {
            return Err(HpnlError::InvalidLength {
                len,
                capacity: target.capacity(),
            });
        }
        let range = remote
            .subrange(0, len as u64)
            .ok_or(HpnlError::InvalidLength {
                len,
                capacity: remote.len as usize,
            })?;
        self.ctx
            .transport
            .post_read(self.eq, local, &range)
            .map_err(|e| self.map_post_error(e))?;
        tracing::trace!(eq = %self.eq, buffer = %local, len, "read posted");
        Ok(())
    }

    /// A receive buffer, typically the one named by a `Received` completion.
    pub fn recv_buffer(&self, id: BufferId) -> Result<Arc<MemoryBuffer>> {
        self.ctx.recv_pool.acquire(id)
    }

    /// A registered RMA buffer, typically the target of a `Read` completion.
    pub fn rma_buffer(&self, id: BufferId) -> Result<Arc<MemoryBuffer>> {
        self.ctx.rma_pool.acquire(id)
    }

    /// Ask for teardown. The first call queues the connection for the
    /// reaper; later calls do nothing. A connected connection moves to
    /// `ShuttingDown`, one that never connected goes straight to `Closed`.
    /// Returns whether this call queued the connection.
    pub fn shutdown(self: &Arc<Self>) -> bool {
        let queued = self.transition(ConnectionState::Connected, ConnectionState::ShuttingDown)
            || self.transition(ConnectionState::Connecting, ConnectionState::Closed);
        if queued {
            tracing::debug!(eq = %self.eq, peer = %self.info.peer, "connection shutting down");
            self.reap.offer(Arc::clone(self));
        }
        queued
    }

    /// Post `depth` receive buffers from the receive pool.
    pub(crate) fn post_initial_recvs(&self, depth: usize) -> Result<()> {
        for _ in 0..depth {
            let buffer = self.ctx.recv_pool.checkout_or_grow()?;
            let id = buffer.id();
            self.recv_buffers.lock().insert(id);
            if let Err(err) = self.ctx.transport.post_recv(self.eq, id) {
                self.recv_buffers.lock().remove(&id);
                self.ctx.recv_pool.release(id)?;
                return Err(self.map_post_error(err));
            }
        }
        Ok(())
    }

    fn repost_recv(&self, id: BufferId) {
        if let Ok(buffer) = self.ctx.recv_pool.acquire(id) {
            buffer.clear();
        }
        if !self.is_connected() {
            return;
        }
        if let Err(err) = self.ctx.transport.post_recv(self.eq, id) {
            tracing::warn!(eq = %self.eq, buffer = %id, error = %err, "cannot repost receive buffer");
            if self.recv_buffers.lock().remove(&id) {
                self.ctx.recv_pool.release(id).ok();
            }
        }
    }

    /// Route one completion to its handler.
    ///
    /// Completions arriving after [`shutdown`](Self::shutdown) are dropped.
    pub fn dispatch(self: &Arc<Self>, kind: EventKind, buffer_id: BufferId, len: usize) {
        let _guard = self.dispatch_guard();
        let state = self.state();
        if state >= ConnectionState::ShuttingDown {
            tracing::debug!(eq = %self.eq, %kind, %state, "dropping completion for closing connection");
            return;
        }

        match kind {
            EventKind::Connected => {
                if !self.transition(ConnectionState::Connecting, ConnectionState::Connected) {
                    tracing::warn!(eq = %self.eq, %state, "duplicate CONNECTED completion");
                    return;
                }
                self.invoke(kind, buffer_id, len);
            }
            EventKind::Received => {
                self.invoke(kind, buffer_id, len);
                self.repost_recv(buffer_id);
            }
            EventKind::Sent => {
                self.invoke(kind, buffer_id, len);
                if let Err(err) = self.put_send_buffer(buffer_id) {
                    tracing::debug!(eq = %self.eq, buffer = %buffer_id, error = %err, "send buffer already returned");
                }
            }
            EventKind::Read => self.invoke(kind, buffer_id, len),
            EventKind::Shutdown => {
                self.shutdown();
            }
        }
    }

    fn invoke(self: &Arc<Self>, kind: EventKind, buffer_id: BufferId, len: usize) {
        match self.handler(kind) {
            Some(handler) => handler(self, buffer_id, len),
            None => tracing::trace!(eq = %self.eq, %kind, "no handler assigned"),
        }
    }

    /// Return every buffer held by this connection to its pool.
    pub(crate) fn release_buffers(&self) {
        let sends: Vec<BufferId> = self.send_buffers.lock().drain().collect();
        for id in sends {
            if let Err(err) = self.ctx.send_pool.release(id) {
                tracing::warn!(eq = %self.eq, buffer = %id, error = %err, "cannot release send buffer");
            }
        }
        let recvs: Vec<BufferId> = self.recv_buffers.lock().drain().collect();
        for id in recvs {
            if let Err(err) = self.ctx.recv_pool.release(id) {
                tracing::warn!(eq = %self.eq, buffer = %id, error = %err, "cannot release receive buffer");
            }
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed.into(), Ordering::Release);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("eq", &self.eq)
            .field("handle", &self.info.handle)
            .field("local", &self.info.local)
            .field("peer", &self.info.peer)
            .field("state", &self.state())
            .finish()
    }
}
