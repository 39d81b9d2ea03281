use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hpnl_net::{BufferRole, Completion, ConnectionInfo, EventKind, MemoryRegion, TransportError};
use hpnl_types::{Address, BufferId, ConnectionHandle, EventQueueHandle, RemoteKey};
use parking_lot::{Condvar, Mutex};

use crate::transport::LoopbackTransport;

/// First port handed to the active side of a connection.
const EPHEMERAL_PORT_BASE: u16 = 40000;

pub(crate) type DomainId = u64;

/// The shared in-process medium. Cloning yields another handle to the same fabric.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    inner: Arc<Fabric>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every registration once `limit` regions are registered fabric-wide.
    pub fn with_registration_limit(limit: usize) -> Self {
        let fabric = Self::new();
        fabric.inner.state.lock().registration_limit = Some(limit);
        fabric
    }

    /// Open a new transport domain on this fabric.
    pub fn transport(&self) -> Arc<LoopbackTransport> {
        let domain = self.inner.next_domain.fetch_add(1, Ordering::Relaxed);
        Arc::new(LoopbackTransport::new(Arc::clone(&self.inner), domain))
    }

    /// Put the fabric into a failed state: every later call returns
    /// [`TransportError::Fatal`]. Blocked pollers wake immediately.
    pub fn inject_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(%reason, "loopback fabric failing");
        self.inner.state.lock().fatal = Some(reason);
        self.inner.cond.notify_all();
    }

    /// Number of regions currently registered across all domains.
    pub fn registered_buffers(&self) -> usize {
        self.inner.state.lock().buffers.len()
    }

    /// Number of live event queues across all domains.
    pub fn endpoint_count(&self) -> usize {
        self.inner.state.lock().endpoints.len()
    }

    pub fn is_listening(&self, addr: Address) -> bool {
        self.inner.state.lock().listeners.contains_key(&addr)
    }
}

#[derive(Default)]
pub(crate) struct Fabric {
    pub(crate) state: Mutex<FabricState>,
    pub(crate) cond: Condvar,
    next_domain: AtomicU64,
}

pub(crate) struct Registration {
    pub(crate) region: Arc<MemoryRegion>,
    pub(crate) rkey: RemoteKey,
}

pub(crate) struct Endpoint {
    pub(crate) domain: DomainId,
    pub(crate) kind: EndpointKind,
    pub(crate) events: VecDeque<Completion>,
}

pub(crate) enum EndpointKind {
    Passive { addr: Address },
    Active(ActiveEndpoint),
}

pub(crate) struct ActiveEndpoint {
    pub(crate) info: ConnectionInfo,
    /// `None` until the request is answered, and again after the peer left.
    pub(crate) peer_eq: Option<EventQueueHandle>,
    pub(crate) posted_recvs: VecDeque<BufferId>,
    /// Messages that arrived while no receive was posted.
    pub(crate) backlog: VecDeque<Vec<u8>>,
}

#[derive(Default)]
pub(crate) struct FabricState {
    last_eq: EventQueueHandle,
    last_conn: ConnectionHandle,
    last_key: RemoteKey,
    next_port: u16,
    pub(crate) listeners: HashMap<Address, EventQueueHandle>,
    pub(crate) endpoints: HashMap<EventQueueHandle, Endpoint>,
    pub(crate) buffers: HashMap<(DomainId, BufferRole, BufferId), Registration>,
    pub(crate) remote_keys: HashMap<RemoteKey, Arc<MemoryRegion>>,
    pub(crate) registration_limit: Option<usize>,
    pub(crate) fatal: Option<String>,
}

impl FabricState {
    pub(crate) fn check_fatal(&self) -> Result<(), TransportError> {
        match &self.fatal {
            Some(reason) => Err(TransportError::Fatal(reason.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn alloc_eq(&mut self) -> EventQueueHandle {
        self.last_eq = self.last_eq.next();
        self.last_eq
    }

    pub(crate) fn alloc_conn(&mut self) -> ConnectionHandle {
        self.last_conn = self.last_conn.next();
        self.last_conn
    }

    pub(crate) fn alloc_key(&mut self) -> RemoteKey {
        self.last_key = self.last_key.next();
        self.last_key
    }

    pub(crate) fn alloc_port(&mut self) -> u16 {
        let port = EPHEMERAL_PORT_BASE.wrapping_add(self.next_port);
        self.next_port = self.next_port.wrapping_add(1);
        port
    }

    /// The listener that would answer a request for `addr`.
    pub(crate) fn find_listener(&self, addr: Address) -> Option<EventQueueHandle> {
        self.listeners
            .get(&addr)
            .or_else(|| self.listeners.get(&addr.with_unspecified_ip()))
            .copied()
    }

    pub(crate) fn push_event(&mut self, eq: EventQueueHandle, completion: Completion) {
        if let Some(ep) = self.endpoints.get_mut(&eq) {
            ep.events.push_back(completion);
        }
    }

    pub(crate) fn active_mut(
        &mut self,
        eq: EventQueueHandle,
    ) -> Result<&mut ActiveEndpoint, TransportError> {
        match self.endpoints.get_mut(&eq) {
            Some(Endpoint {
                kind: EndpointKind::Active(active),
                ..
            }) => Ok(active),
            Some(_) => Err(TransportError::NotConnected(eq)),
            None => Err(TransportError::UnknownEventQueue(eq)),
        }
    }

    /// Hand queued messages to posted receives on `eq` until either runs out.
    pub(crate) fn deliver_backlog(&mut self, eq: EventQueueHandle) {
        let domain = match self.endpoints.get(&eq) {
            Some(ep) => ep.domain,
            None => return,
        };
        loop {
            let Ok(active) = self.active_mut(eq) else {
                return;
            };
            if active.backlog.is_empty() || active.posted_recvs.is_empty() {
                return;
            }
            let (Some(id), Some(data)) = (active.posted_recvs.pop_front(), active.backlog.pop_front())
            else {
                return;
            };
            let Some(reg) = self.buffers.get(&(domain, BufferRole::Recv, id)) else {
                tracing::warn!(%eq, %id, "posted receive buffer vanished, dropping message");
                continue;
            };
            if !reg.region.copy_in(0, &data) {
                tracing::warn!(
                    %eq,
                    %id,
                    len = data.len(),
                    capacity = reg.region.len(),
                    "message larger than receive buffer, dropping"
                );
                self.active_mut(eq).map(|a| a.posted_recvs.push_front(id)).ok();
                continue;
            }
            let len = data.len();
            self.push_event(
                eq,
                Completion::Event {
                    eq,
                    kind: EventKind::Received,
                    buffer_id: id,
                    len,
                },
            );
        }
    }
}
