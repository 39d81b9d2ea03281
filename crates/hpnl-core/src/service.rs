//! The event queue service: owns the transport context, the buffer pools and
//! the queue-to-connection mapping, and drives the polling loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use dashmap::DashMap;
use hpnl_net::{
    BufferRole, Completion, ConnectionInfo, EventKind, MemoryRegion, Transport, TransportError,
};
use hpnl_types::{Address, BufferId, EventQueueHandle, RemoteKey};
use parking_lot::{Mutex, RwLock};

use crate::buffer::MemoryBuffer;
use crate::config::ServiceConfig;
use crate::connection::{Connection, ConnectionState, Handlers};
use crate::error::{HpnlError, Result};
use crate::poller::EventPollingLoop;
use crate::pool::BufferPool;
use crate::reap::ReapQueue;

/// State shared by the service and every connection it creates.
pub(crate) struct ServiceContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) send_pool: BufferPool,
    pub(crate) recv_pool: BufferPool,
    pub(crate) rma_pool: BufferPool,
}

impl ServiceContext {
    pub(crate) fn new(config: &ServiceConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let send_pool = BufferPool::new(
            BufferRole::Send,
            config.buffer_size,
            config.buffer_num,
            config.next_batch_size,
            Arc::clone(&transport),
        )?;
        let recv_pool = BufferPool::new(
            BufferRole::Recv,
            config.buffer_size,
            config.recv_buffer_count(),
            config.next_batch_size,
            Arc::clone(&transport),
        )?;
        let rma_pool = BufferPool::new(
            BufferRole::Rma,
            config.buffer_size,
            0,
            config.next_batch_size,
            Arc::clone(&transport),
        )?;
        Ok(Self {
            transport,
            send_pool,
            recv_pool,
            rma_pool,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueKind {
    Listener,
    Connection,
}

type ConnectLatch = Sender<Result<Arc<Connection>>>;

/// Multiplexes event queues over one transport and dispatches their
/// completions to connection handlers.
///
/// A client service owns exactly one connection: reaping it stops the
/// polling loop. A server service listens and keeps running until
/// [`stop`](Self::stop).
pub struct EventQueueService {
    config: ServiceConfig,
    ctx: Arc<ServiceContext>,
    reap: Arc<ReapQueue>,
    connections: DashMap<EventQueueHandle, Arc<Connection>>,
    active: DashMap<EventQueueHandle, QueueKind>,
    pending: Mutex<HashMap<EventQueueHandle, ConnectLatch>>,
    defaults: RwLock<Handlers>,
    stop: AtomicBool,
    running: AtomicBool,
    termination: Mutex<Option<String>>,
    poller: Mutex<Option<EventPollingLoop>>,
}

impl EventQueueService {
    /// Validate `config` and register the initial send and receive pools.
    pub fn new(config: ServiceConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;
        let ctx = ServiceContext::new(&config, transport)?;
        tracing::info!(
            role = if config.is_server { "server" } else { "client" },
            buffer_size = config.buffer_size,
            send_buffers = ctx.send_pool.len(),
            recv_buffers = ctx.recv_pool.len(),
            worker_threads = config.worker_threads,
            "event queue service created"
        );
        Ok(Arc::new(Self {
            config,
            ctx: Arc::new(ctx),
            reap: Arc::new(ReapQueue::new()),
            connections: DashMap::new(),
            active: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            defaults: RwLock::new(Handlers::default()),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            termination: Mutex::new(None),
            poller: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn is_server(&self) -> bool {
        self.config.is_server
    }

    pub fn send_pool(&self) -> &BufferPool {
        &self.ctx.send_pool
    }

    pub fn recv_pool(&self) -> &BufferPool {
        &self.ctx.recv_pool
    }

    pub fn reap_queue(&self) -> &ReapQueue {
        &self.reap
    }

    /// Service-wide default for `kind`, copied into each connection when it
    /// connects.
    pub fn set_callback<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Arc<Connection>, BufferId, usize) + Send + Sync + 'static,
    {
        self.defaults.write().set(kind, Some(Arc::new(handler)));
    }

    fn check_usable(&self) -> Result<()> {
        if let Some(reason) = self.termination.lock().clone() {
            return Err(HpnlError::LoopTerminated(reason));
        }
        Ok(())
    }

    /// Start accepting connections on `addr`. Server role only.
    pub fn listen(&self, addr: Address) -> Result<EventQueueHandle> {
        if !self.config.is_server {
            return Err(HpnlError::WrongRole("listen requires a server service"));
        }
        self.check_usable()?;
        let eq = self
            .ctx
            .transport
            .listen(addr)
            .map_err(|source| HpnlError::BindFailure { addr, source })?;
        self.active.insert(eq, QueueKind::Listener);
        tracing::info!(%addr, %eq, "listening");
        Ok(eq)
    }

    /// Connect to `addr` and block until the connection is established.
    ///
    /// `timeout_ms == 0` waits indefinitely. On timeout the event queue is
    /// destroyed and a late `Connected` completion for it is ignored.
    pub fn connect(&self, addr: Address, timeout_ms: u64) -> Result<Arc<Connection>> {
        self.check_usable()?;
        if !self.is_running() {
            return Err(HpnlError::NotRunning);
        }
        let eq = self
            .ctx
            .transport
            .connect(addr)
            .map_err(|source| HpnlError::ConnectFailed { addr, source })?;
        let (tx, rx) = channel::bounded(1);
        {
            // `loop_exited` clears `running` under this lock, so a latch
            // inserted here is always released when the loop exits.
            let mut pending = self.pending.lock();
            if !self.is_running() {
                drop(pending);
                self.abandon_connect(eq);
                return Err(self.stopped_error());
            }
            pending.insert(eq, tx);
        }
        self.active.insert(eq, QueueKind::Connection);
        tracing::debug!(%addr, %eq, timeout_ms, "connecting");

        let outcome = if timeout_ms == 0 {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            rx.recv_timeout(Duration::from_millis(timeout_ms))
        };
        match outcome {
            Ok(result) => {
                if result.is_err() {
                    self.abandon_connect(eq);
                }
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                self.pending.lock().remove(&eq);
                // The loop may have resolved the latch just before removal.
                if let Ok(result) = rx.try_recv() {
                    return result;
                }
                self.abandon_connect(eq);
                tracing::warn!(%addr, %eq, timeout_ms, "connect timed out");
                Err(HpnlError::ConnectTimeout { addr, timeout_ms })
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.abandon_connect(eq);
                Err(self.stopped_error())
            }
        }
    }

    fn stopped_error(&self) -> HpnlError {
        match self.termination() {
            Some(reason) => HpnlError::LoopTerminated(reason),
            None => HpnlError::NotRunning,
        }
    }

    fn abandon_connect(&self, eq: EventQueueHandle) {
        self.pending.lock().remove(&eq);
        if let Some(conn) = self.connection(eq) {
            // Connected raced with the timeout; let the reaper tear it down.
            conn.shutdown();
            return;
        }
        self.active.remove(&eq);
        if let Err(err) = self.ctx.transport.destroy(eq) {
            tracing::debug!(%eq, error = %err, "destroying abandoned event queue failed");
        }
    }

    /// Install a connection for a queue that just reported `Connected`.
    pub(crate) fn register_connection(
        &self,
        eq: EventQueueHandle,
        info: ConnectionInfo,
    ) -> Result<Arc<Connection>> {
        let conn = Arc::new(Connection::new(
            eq,
            info,
            Arc::clone(&self.ctx),
            Arc::clone(&self.reap),
        ));
        conn.install_handlers(self.defaults.read().clone());
        if let Err(err) = conn.post_initial_recvs(self.config.recv_depth) {
            conn.release_buffers();
            conn.mark_closed();
            return Err(err);
        }
        self.connections.insert(eq, Arc::clone(&conn));
        self.active.insert(eq, QueueKind::Connection);
        tracing::info!(%eq, handle = %info.handle, local = %info.local, peer = %info.peer, "connection registered");
        Ok(conn)
    }

    /// Forget the connection on `eq`. A client service stops its loop here.
    pub fn deregister_connection(&self, eq: EventQueueHandle) -> Option<Arc<Connection>> {
        let conn = self.connections.remove(&eq).map(|(_, conn)| conn);
        self.active.remove(&eq);
        if conn.is_some() {
            tracing::debug!(%eq, "connection deregistered");
            if !self.config.is_server {
                self.stop();
            }
        }
        conn
    }

    /// Route a completion on `eq` to its connection. A queue without a
    /// connection is ignored, except that `Connected` on an active queue
    /// creates one.
    pub fn dispatch_event(
        &self,
        eq: EventQueueHandle,
        kind: EventKind,
        buffer_id: BufferId,
        len: usize,
    ) {
        if kind == EventKind::Connected && !self.connections.contains_key(&eq) {
            self.on_connected(eq);
            return;
        }
        let conn = self.connections.get(&eq).map(|entry| Arc::clone(entry.value()));
        match conn {
            Some(conn) => {
                tracing::debug!(%eq, %kind, buffer = %buffer_id, len, "dispatching completion");
                conn.dispatch(kind, buffer_id, len);
            }
            None => tracing::trace!(%eq, %kind, "completion for unknown queue ignored"),
        }
    }

    fn on_connected(&self, eq: EventQueueHandle) {
        if !self.active.contains_key(&eq) {
            tracing::warn!(%eq, "CONNECTED for an abandoned event queue dropped");
            return;
        }
        let registered = self
            .ctx
            .transport
            .connection_info(eq)
            .map_err(HpnlError::from)
            .and_then(|info| self.register_connection(eq, info));
        let latch = self.pending.lock().remove(&eq);
        match registered {
            Ok(conn) => {
                conn.dispatch(EventKind::Connected, BufferId(0), 0);
                if let Some(latch) = latch {
                    latch.try_send(Ok(conn)).ok();
                }
            }
            Err(err) => {
                tracing::warn!(%eq, error = %err, "cannot set up connection");
                self.active.remove(&eq);
                if let Err(err) = self.ctx.transport.destroy(eq) {
                    tracing::debug!(%eq, error = %err, "cannot destroy event queue after failed setup");
                }
                if let Some(latch) = latch {
                    latch.try_send(Err(err)).ok();
                }
            }
        }
    }

    /// Handle one record from the transport.
    pub(crate) fn handle_completion(&self, completion: Completion) {
        match completion {
            Completion::Accepted { listener, eq } => {
                tracing::debug!(%listener, %eq, "connection request accepted");
                self.active.insert(eq, QueueKind::Connection);
            }
            Completion::Event {
                eq,
                kind,
                buffer_id,
                len,
            } => self.dispatch_event(eq, kind, buffer_id, len),
        }
    }

    /// Drain the reap queue: tear down every connection queued so far.
    pub fn process_external_events(&self) -> usize {
        self.reap.drain_all(|conn| self.reap_connection(&conn))
    }

    fn reap_connection(&self, conn: &Arc<Connection>) {
        let _guard = conn.dispatch_guard();
        let eq = conn.event_queue();
        match self.ctx.transport.destroy(eq) {
            Ok(()) | Err(TransportError::UnknownEventQueue(_)) => {}
            Err(err) => tracing::warn!(%eq, error = %err, "cannot destroy event queue"),
        }
        // Only a connection that reached CONNECTED reports its shutdown.
        let was_connected = conn.state() == ConnectionState::ShuttingDown;
        conn.release_buffers();
        conn.mark_closed();
        if was_connected {
            if let Some(handler) = conn.handler(EventKind::Shutdown) {
                handler(conn, BufferId(0), 0);
            }
        }
        self.deregister_connection(eq);
        tracing::info!(%eq, peer = %conn.peer_addr(), "connection closed");
    }

    /// Register caller-provided bytes for remote access. Only the first
    /// `size` bytes are exposed.
    pub fn register_remote_access_buffer(
        &self,
        mut bytes: Vec<u8>,
        size: usize,
    ) -> Result<(BufferId, RemoteKey)> {
        if size == 0 || size > bytes.len() {
            return Err(HpnlError::InvalidLength {
                len: size,
                capacity: bytes.len(),
            });
        }
        bytes.truncate(size);
        let buffer = self.ctx.rma_pool.adopt(MemoryRegion::from_vec(bytes))?;
        tracing::debug!(id = %buffer.id(), size, "remote access buffer registered");
        Ok((buffer.id(), buffer.remote_key()))
    }

    /// Allocate and register a zeroed buffer for remote access.
    pub fn allocate_remote_access_buffer(&self, size: usize) -> Result<Arc<MemoryBuffer>> {
        if size == 0 {
            return Err(HpnlError::InvalidLength {
                len: 0,
                capacity: 0,
            });
        }
        self.ctx.rma_pool.adopt(MemoryRegion::zeroed(size))
    }

    pub fn remote_access_buffer(&self, id: BufferId) -> Result<Arc<MemoryBuffer>> {
        self.ctx.rma_pool.acquire(id)
    }

    /// Deregister a remote access buffer.
    pub fn unregister(&self, id: BufferId) -> Result<()> {
        self.ctx.rma_pool.remove(id)
    }

    pub fn connection(&self, eq: EventQueueHandle) -> Option<Arc<Connection>> {
        self.connections.get(&eq).map(|entry| Arc::clone(entry.value()))
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot of the queues the loop polls.
    pub fn active_queues(&self) -> Vec<EventQueueHandle> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    pub(crate) fn snapshot_active(&self, out: &mut Vec<EventQueueHandle>) {
        out.clear();
        out.extend(self.active.iter().map(|entry| *entry.key()));
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.ctx.transport
    }

    /// Spawn the polling loop.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.check_usable()?;
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return Err(HpnlError::AlreadyRunning);
        }
        self.stop.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);
        match EventPollingLoop::spawn(Arc::clone(self)) {
            Ok(handle) => {
                *poller = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Ask the polling loop to exit after its current iteration.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            tracing::debug!("event loop stop requested");
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Wait for the polling loop to exit. Returns `LoopTerminated` if it
    /// stopped on a fatal transport error.
    pub fn join(&self) -> Result<()> {
        let poller = self.poller.lock().take();
        match poller {
            Some(poller) => poller.join(),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Reason the loop terminated on a fatal error, if it did.
    pub fn termination(&self) -> Option<String> {
        self.termination.lock().clone()
    }

    /// Called by the loop thread on exit. Pending connects are released.
    pub(crate) fn loop_exited(&self, fatal: Option<String>) {
        let mut pending = self.pending.lock();
        if let Some(reason) = &fatal {
            *self.termination.lock() = Some(reason.clone());
        }
        self.running.store(false, Ordering::Release);
        let latches = std::mem::take(&mut *pending);
        drop(pending);
        if let Some(reason) = fatal {
            for (_, latch) in latches {
                latch
                    .try_send(Err(HpnlError::LoopTerminated(reason.clone())))
                    .ok();
            }
        }
    }

    /// Number of connects waiting for their `Connected` completion.
    pub fn pending_connects(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for EventQueueService {
    fn drop(&mut self) {
        for entry in self.active.iter() {
            self.ctx.transport.destroy(*entry.key()).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use hpnl_net_loopback::LoopbackFabric;

    fn small_config(is_server: bool) -> ServiceConfig {
        ServiceConfig {
            is_server,
            buffer_num: 4,
            buffer_size: 256,
            next_batch_size: 2,
            recv_depth: 4,
            poll_timeout_ms: 10,
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn test_new_registers_pools() {
        let fabric = LoopbackFabric::new();
        let service = EventQueueService::new(small_config(true), fabric.transport()).unwrap();
        assert_eq!(service.send_pool().len(), 4);
        assert_eq!(service.recv_pool().len(), 8);
        assert_eq!(fabric.registered_buffers(), 12);
        drop(service);
        assert_eq!(fabric.registered_buffers(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let fabric = LoopbackFabric::new();
        let config = ServiceConfig {
            buffer_size: 8,
            ..ServiceConfig::default()
        };
        assert!(matches!(
            EventQueueService::new(config, fabric.transport()),
            Err(HpnlError::Config(_))
        ));
    }

    #[test]
    fn test_listen_role_and_bind_failure() {
        let fabric = LoopbackFabric::new();
        let client = EventQueueService::new(small_config(false), fabric.transport()).unwrap();
        assert!(matches!(
            client.listen(Address::localhost(9000)),
            Err(HpnlError::WrongRole(_))
        ));

        let server = EventQueueService::new(small_config(true), fabric.transport()).unwrap();
        let eq = server.listen(Address::localhost(9000)).unwrap();
        assert_eq!(server.active_queues(), vec![eq]);
        assert!(matches!(
            server.listen(Address::localhost(9000)),
            Err(HpnlError::BindFailure { .. })
        ));
    }

    #[test]
    fn test_connect_requires_running_loop() {
        let fabric = LoopbackFabric::new();
        let client = EventQueueService::new(small_config(false), fabric.transport()).unwrap();
        assert!(matches!(
            client.connect(Address::localhost(9001), 100),
            Err(HpnlError::NotRunning)
        ));
    }

    #[test]
    fn test_dispatch_to_unknown_queue_is_noop() {
        let fabric = LoopbackFabric::new();
        let service = EventQueueService::new(small_config(true), fabric.transport()).unwrap();
        service.dispatch_event(EventQueueHandle(404), EventKind::Received, BufferId(1), 10);
        service.dispatch_event(EventQueueHandle(404), EventKind::Connected, BufferId(0), 0);
        assert!(service.connections().is_empty());
    }

    #[test]
    fn test_start_twice() {
        let fabric = LoopbackFabric::new();
        let service = EventQueueService::new(small_config(true), fabric.transport()).unwrap();
        service.start().unwrap();
        assert!(service.is_running());
        assert!(matches!(service.start(), Err(HpnlError::AlreadyRunning)));
        service.stop();
        service.join().unwrap();
        assert!(!service.is_running());
    }

    #[test]
    fn test_remote_access_buffers() {
        let fabric = LoopbackFabric::new();
        let service = EventQueueService::new(small_config(true), fabric.transport()).unwrap();
        let (id, _rkey) = service
            .register_remote_access_buffer(vec![1; 64], 32)
            .unwrap();
        assert_eq!(service.remote_access_buffer(id).unwrap().capacity(), 32);
        assert!(service.register_remote_access_buffer(vec![1; 8], 9).is_err());

        let allocated = service.allocate_remote_access_buffer(128).unwrap();
        assert_ne!(allocated.id(), id);
        service.unregister(id).unwrap();
        assert!(matches!(
            service.unregister(id),
            Err(HpnlError::InvalidBufferId { .. })
        ));
    }

    fn pump(service: &EventQueueService, queues: &[EventQueueHandle]) {
        let mut out = Vec::new();
        service
            .transport()
            .poll(queues, Duration::from_millis(50), 16, &mut out)
            .unwrap();
        for completion in out.drain(..) {
            service.handle_completion(completion);
        }
    }

    #[test]
    fn test_failed_recv_setup_returns_buffers() {
        // Three send and three receive buffers fill the fabric; the receive
        // pool cannot grow.
        let fabric = LoopbackFabric::with_registration_limit(6);
        let config = ServiceConfig {
            buffer_num: 3,
            recv_buffer_multiplier: 1,
            recv_depth: 2,
            next_batch_size: 1,
            ..small_config(true)
        };
        let server = EventQueueService::new(config, fabric.transport()).unwrap();
        let listener = server.listen(Address::localhost(9003)).unwrap();
        let peer = fabric.transport();
        peer.connect(Address::localhost(9003)).unwrap();
        peer.connect(Address::localhost(9003)).unwrap();

        pump(&server, &[listener]);
        let queues = server.active_queues();
        pump(&server, &queues);

        let conns = server.connections();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].posted_recv_count(), 2);
        assert_eq!(server.recv_pool().checked_out(), 2);
        assert_eq!(server.recv_pool().len(), 3);

        conns[0].shutdown();
        assert_eq!(server.process_external_events(), 1);
        assert_eq!(server.recv_pool().checked_out(), 0);
        assert_eq!(server.recv_pool().available(), 3);
    }

    #[test]
    fn test_defaults_copied_on_connect() {
        let fabric = LoopbackFabric::new();
        let server = EventQueueService::new(small_config(true), fabric.transport()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        server.set_callback(EventKind::Connected, move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let listener = server.listen(Address::localhost(9002)).unwrap();
        let peer = fabric.transport();
        let client_eq = peer.connect(Address::localhost(9002)).unwrap();

        let mut out = Vec::new();
        server
            .transport()
            .poll(&[listener], Duration::from_millis(50), 8, &mut out)
            .unwrap();
        for completion in out.drain(..) {
            server.handle_completion(completion);
        }
        let queues = server.active_queues();
        server
            .transport()
            .poll(&queues, Duration::from_millis(50), 8, &mut out)
            .unwrap();
        for completion in out.drain(..) {
            server.handle_completion(completion);
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let conns = server.connections();
        assert_eq!(conns.len(), 1);
        assert!(conns[0].is_connected());
        assert_eq!(conns[0].posted_recv_count(), 4);
        assert_ne!(conns[0].event_queue(), client_eq);

        assert!(conns[0].shutdown());
        assert_eq!(server.process_external_events(), 1);
        assert!(server.connections().is_empty());
        assert_eq!(server.recv_pool().available(), 8);
    }
}
