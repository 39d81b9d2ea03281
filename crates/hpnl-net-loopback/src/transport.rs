use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hpnl_net::{
    BufferRole, Completion, ConnectionInfo, EventKind, MemoryRegion, RemoteBuffer, Transport,
    TransportError,
};
use hpnl_types::{Address, BufferId, EventQueueHandle, RemoteKey};

use crate::fabric::{
    ActiveEndpoint, DomainId, Endpoint, EndpointKind, Fabric, FabricState, Registration,
};

/// One provider domain on a [`LoopbackFabric`](crate::LoopbackFabric).
///
/// Buffers registered here are only visible to queues opened here, except
/// through their remote key.
pub struct LoopbackTransport {
    fabric: Arc<Fabric>,
    domain: DomainId,
}

impl LoopbackTransport {
    pub(crate) fn new(fabric: Arc<Fabric>, domain: DomainId) -> Self {
        Self { fabric, domain }
    }

    fn registered<'a>(
        &self,
        state: &'a FabricState,
        role: BufferRole,
        id: BufferId,
    ) -> Result<&'a Registration, TransportError> {
        state
            .buffers
            .get(&(self.domain, role, id))
            .ok_or(TransportError::UnknownBuffer { role, id })
    }
}

fn active_endpoint(
    domain: DomainId,
    info: ConnectionInfo,
    peer_eq: Option<EventQueueHandle>,
) -> Endpoint {
    Endpoint {
        domain,
        kind: EndpointKind::Active(ActiveEndpoint {
            info,
            peer_eq,
            posted_recvs: VecDeque::new(),
            backlog: VecDeque::new(),
        }),
        events: VecDeque::new(),
    }
}

/// Remove `eq`, unbind its listener and tell a connected peer.
fn teardown(state: &mut FabricState, eq: EventQueueHandle) -> bool {
    let Some(ep) = state.endpoints.remove(&eq) else {
        return false;
    };
    match ep.kind {
        EndpointKind::Passive { addr } => {
            state.listeners.remove(&addr);
        }
        EndpointKind::Active(active) => {
            if let Some(peer) = active.peer_eq {
                if let Ok(peer_active) = state.active_mut(peer) {
                    peer_active.peer_eq = None;
                }
                state.push_event(peer, Completion::bare(peer, EventKind::Shutdown));
            }
        }
    }
    true
}

impl Transport for LoopbackTransport {
    fn listen(&self, addr: Address) -> Result<EventQueueHandle, TransportError> {
        let mut state = self.fabric.state.lock();
        state.check_fatal()?;
        if state.listeners.contains_key(&addr) {
            return Err(TransportError::AddressInUse(addr));
        }
        let eq = state.alloc_eq();
        state.endpoints.insert(
            eq,
            Endpoint {
                domain: self.domain,
                kind: EndpointKind::Passive { addr },
                events: VecDeque::new(),
            },
        );
        state.listeners.insert(addr, eq);
        tracing::debug!(%addr, %eq, domain = self.domain, "listening");
        Ok(eq)
    }

    fn connect(&self, addr: Address) -> Result<EventQueueHandle, TransportError> {
        let mut state = self.fabric.state.lock();
        state.check_fatal()?;
        let eq = state.alloc_eq();
        let local = Address::localhost(state.alloc_port());
        let info = ConnectionInfo {
            handle: state.alloc_conn(),
            local,
            peer: addr,
        };

        let Some(listener) = state.find_listener(addr) else {
            // Nobody answers; the request stays outstanding until destroyed.
            tracing::debug!(%addr, %eq, "connect to address without listener");
            state
                .endpoints
                .insert(eq, active_endpoint(self.domain, info, None));
            return Ok(eq);
        };

        let listener_domain = state
            .endpoints
            .get(&listener)
            .map(|ep| ep.domain)
            .ok_or(TransportError::UnknownEventQueue(listener))?;
        let server_eq = state.alloc_eq();
        let server_info = ConnectionInfo {
            handle: state.alloc_conn(),
            local: addr,
            peer: local,
        };
        state.endpoints.insert(
            server_eq,
            active_endpoint(listener_domain, server_info, Some(eq)),
        );
        state
            .endpoints
            .insert(eq, active_endpoint(self.domain, info, Some(server_eq)));

        state.push_event(
            listener,
            Completion::Accepted {
                listener,
                eq: server_eq,
            },
        );
        state.push_event(server_eq, Completion::bare(server_eq, EventKind::Connected));
        state.push_event(eq, Completion::bare(eq, EventKind::Connected));
        drop(state);
        self.fabric.cond.notify_all();

        tracing::debug!(%addr, %local, client_eq = %eq, %server_eq, "loopback connection established");
        Ok(eq)
    }

    fn connection_info(&self, eq: EventQueueHandle) -> Result<ConnectionInfo, TransportError> {
        let mut state = self.fabric.state.lock();
        state.active_mut(eq).map(|active| active.info)
    }

    fn poll(
        &self,
        eqs: &[EventQueueHandle],
        timeout: Duration,
        max: usize,
        out: &mut Vec<Completion>,
    ) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let start = out.len();
        let mut state = self.fabric.state.lock();
        loop {
            state.check_fatal()?;
            for eq in eqs {
                let Some(ep) = state.endpoints.get_mut(eq) else {
                    continue;
                };
                while out.len() - start < max {
                    match ep.events.pop_front() {
                        Some(completion) => out.push(completion),
                        None => break,
                    }
                }
            }
            if out.len() > start || Instant::now() >= deadline {
                return Ok(());
            }
            self.fabric.cond.wait_until(&mut state, deadline);
        }
    }

    fn register_buffer(
        &self,
        role: BufferRole,
        id: BufferId,
        region: Arc<MemoryRegion>,
    ) -> Result<RemoteKey, TransportError> {
        let mut state = self.fabric.state.lock();
        state.check_fatal()?;
        if let Some(limit) = state.registration_limit {
            if state.buffers.len() >= limit {
                return Err(TransportError::Registration(format!(
                    "registration limit of {limit} regions reached"
                )));
            }
        }
        let key = (self.domain, role, id);
        if state.buffers.contains_key(&key) {
            return Err(TransportError::Registration(format!(
                "{role} buffer {id} is already registered"
            )));
        }
        let rkey = state.alloc_key();
        state.remote_keys.insert(rkey, Arc::clone(&region));
        state.buffers.insert(key, Registration { region, rkey });
        Ok(rkey)
    }

    fn deregister_buffer(&self, role: BufferRole, id: BufferId) -> Result<(), TransportError> {
        let mut state = self.fabric.state.lock();
        let reg = state
            .buffers
            .remove(&(self.domain, role, id))
            .ok_or(TransportError::UnknownBuffer { role, id })?;
        state.remote_keys.remove(&reg.rkey);
        Ok(())
    }

    fn post_recv(&self, eq: EventQueueHandle, id: BufferId) -> Result<(), TransportError> {
        let mut state = self.fabric.state.lock();
        state.check_fatal()?;
        self.registered(&state, BufferRole::Recv, id)?;
        state.active_mut(eq)?.posted_recvs.push_back(id);
        state.deliver_backlog(eq);
        drop(state);
        self.fabric.cond.notify_all();
        Ok(())
    }

    fn post_send(
        &self,
        eq: EventQueueHandle,
        id: BufferId,
        len: usize,
    ) -> Result<(), TransportError> {
        let mut state = self.fabric.state.lock();
        state.check_fatal()?;
        let reg = self.registered(&state, BufferRole::Send, id)?;
        let data = reg
            .region
            .copy_out(0, len)
            .ok_or(TransportError::MessageTooLarge {
                len,
                capacity: reg.region.len(),
            })?;
        let peer = state
            .active_mut(eq)?
            .peer_eq
            .ok_or(TransportError::NotConnected(eq))?;

        state.push_event(
            eq,
            Completion::Event {
                eq,
                kind: EventKind::Sent,
                buffer_id: id,
                len,
            },
        );
        state.active_mut(peer)?.backlog.push_back(data);
        state.deliver_backlog(peer);
        drop(state);
        self.fabric.cond.notify_all();
        Ok(())
    }

    fn post_read(
        &self,
        eq: EventQueueHandle,
        local: BufferId,
        remote: &RemoteBuffer,
    ) -> Result<(), TransportError> {
        let mut state = self.fabric.state.lock();
        state.check_fatal()?;
        if state.active_mut(eq)?.peer_eq.is_none() {
            return Err(TransportError::NotConnected(eq));
        }
        let target = Arc::clone(&self.registered(&state, BufferRole::Rma, local)?.region);
        let source = state
            .remote_keys
            .get(&remote.rkey)
            .cloned()
            .ok_or(TransportError::UnknownRemoteKey(remote.rkey))?;

        let out_of_bounds = TransportError::OutOfBounds {
            addr: remote.addr,
            len: remote.len,
        };
        let Some(offset) = remote.addr.checked_sub(source.addr()) else {
            return Err(out_of_bounds);
        };
        let (Ok(offset), Ok(len)) = (usize::try_from(offset), usize::try_from(remote.len)) else {
            return Err(out_of_bounds);
        };
        let Some(data) = source.copy_out(offset, len) else {
            return Err(out_of_bounds);
        };
        if !target.copy_in(0, &data) {
            return Err(TransportError::MessageTooLarge {
                len,
                capacity: target.len(),
            });
        }

        state.push_event(
            eq,
            Completion::Event {
                eq,
                kind: EventKind::Read,
                buffer_id: local,
                len,
            },
        );
        drop(state);
        self.fabric.cond.notify_all();
        Ok(())
    }

    fn destroy(&self, eq: EventQueueHandle) -> Result<(), TransportError> {
        let mut state = self.fabric.state.lock();
        if !teardown(&mut state, eq) {
            return Err(TransportError::UnknownEventQueue(eq));
        }
        drop(state);
        self.fabric.cond.notify_all();
        tracing::trace!(%eq, "event queue destroyed");
        Ok(())
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let mut state = self.fabric.state.lock();
        let owned: Vec<EventQueueHandle> = state
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.domain == self.domain)
            .map(|(eq, _)| *eq)
            .collect();
        for eq in owned {
            teardown(&mut state, eq);
        }
        let domain = self.domain;
        let keys: Vec<RemoteKey> = state
            .buffers
            .iter()
            .filter(|((d, _, _), _)| *d == domain)
            .map(|(_, reg)| reg.rkey)
            .collect();
        for rkey in keys {
            state.remote_keys.remove(&rkey);
        }
        state.buffers.retain(|(d, _, _), _| *d != domain);
        drop(state);
        self.fabric.cond.notify_all();
    }
}
