//! End-to-end scenarios: a server and a client service sharing one loopback
//! fabric, each with its own polling loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use hpnl_core::{EventQueueService, HpnlError, ServiceConfig};
use hpnl_net::{EventKind, RemoteBuffer};
use hpnl_net_loopback::LoopbackFabric;
use hpnl_types::Address;

const WAIT: Duration = Duration::from_secs(2);

fn config(is_server: bool) -> ServiceConfig {
    ServiceConfig {
        is_server,
        buffer_num: 4,
        buffer_size: 1024,
        next_batch_size: 2,
        recv_depth: 4,
        poll_timeout_ms: 10,
        ..ServiceConfig::default()
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn started(fabric: &LoopbackFabric, is_server: bool) -> Arc<EventQueueService> {
    let service = EventQueueService::new(config(is_server), fabric.transport()).unwrap();
    service.start().unwrap();
    service
}

#[test]
fn test_exchange_64_byte_payloads() {
    let fabric = LoopbackFabric::new();
    let addr = Address::localhost(12000);
    let payload: Vec<u8> = (0..64).collect();

    let server = EventQueueService::new(config(true), fabric.transport()).unwrap();
    let (server_tx, server_rx) = channel::unbounded();
    server.set_callback(EventKind::Received, move |conn, id, len| {
        let frame = conn.recv_buffer(id).unwrap().parse(len).unwrap();
        let mut reply = frame.payload.to_vec();
        reply.reverse();
        conn.send_frame(2, frame.header.seq + 1, &reply).unwrap();
        server_tx
            .send((frame.header, frame.payload.to_vec()))
            .unwrap();
    });
    server.start().unwrap();
    server.listen(addr).unwrap();

    let client = EventQueueService::new(config(false), fabric.transport()).unwrap();
    let (client_tx, client_rx) = channel::unbounded();
    client.set_callback(EventKind::Received, move |conn, id, len| {
        let frame = conn.recv_buffer(id).unwrap().parse(len).unwrap();
        client_tx.send(frame.payload.to_vec()).unwrap();
    });
    client.start().unwrap();

    let conn = client.connect(addr, 2000).unwrap();
    assert!(conn.is_connected());
    assert_eq!(conn.peer_addr(), addr);
    assert!(wait_until(|| server.connections().len() == 1));

    let buffer = conn.take_send_buffer().unwrap();
    let len = buffer.put_data(1, 7, &payload).unwrap();
    conn.send(buffer.id(), len).unwrap();

    let (header, received) = server_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(received, payload);
    assert_eq!(header.frame_type, 1);
    assert_eq!(header.seq, 7);
    assert_eq!(header.connection_id, conn.id());

    let reply = client_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(reply.len(), 64);
    assert_eq!(reply, payload.iter().rev().copied().collect::<Vec<_>>());

    assert!(wait_until(|| conn.send_buffer_count() == 0));
    assert!(wait_until(|| server.send_pool().checked_out() == 0));

    conn.shutdown();
    client.join().unwrap();
    assert!(wait_until(|| server.connections().is_empty()));
    server.stop();
    server.join().unwrap();
}

#[test]
fn test_connect_timeout_within_bounds() {
    let fabric = LoopbackFabric::new();
    let client = started(&fabric, false);

    let started_at = Instant::now();
    let err = client.connect(Address::localhost(12001), 500).unwrap_err();
    let elapsed = started_at.elapsed();

    assert!(matches!(err, HpnlError::ConnectTimeout { timeout_ms: 500, .. }));
    assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
    assert_eq!(client.pending_connects(), 0);
    assert!(client.active_queues().is_empty());
    assert_eq!(fabric.endpoint_count(), 0);

    client.stop();
    client.join().unwrap();
}

#[test]
fn test_unbounded_connect_waits_until_stopped() {
    let fabric = LoopbackFabric::new();
    let client = started(&fabric, false);

    let connecting = Arc::clone(&client);
    let handle = thread::spawn(move || connecting.connect(Address::localhost(12002), 0));
    thread::sleep(Duration::from_millis(300));
    assert!(!handle.is_finished());
    assert_eq!(client.pending_connects(), 1);

    client.stop();
    client.join().unwrap();
    assert!(matches!(handle.join().unwrap(), Err(HpnlError::NotRunning)));
}

#[test]
fn test_unbounded_connects_racing_stop_return() {
    let fabric = LoopbackFabric::new();
    let client = EventQueueService::new(config(false), fabric.transport()).unwrap();

    for round in 0..40 {
        client.start().unwrap();
        let (done_tx, done_rx) = channel::bounded(1);
        let connecting = Arc::clone(&client);
        thread::spawn(move || {
            let outcome = connecting.connect(Address::localhost(12010), 0);
            done_tx.send(outcome).ok();
        });
        if round % 2 == 0 {
            thread::yield_now();
        }
        client.stop();
        client.join().unwrap();

        let outcome = done_rx
            .recv_timeout(WAIT)
            .unwrap_or_else(|_| panic!("connect still blocked after stop in round {round}"));
        assert!(matches!(outcome, Err(HpnlError::NotRunning)));
        assert_eq!(client.pending_connects(), 0);
    }
    assert_eq!(fabric.endpoint_count(), 0);
}

#[test]
fn test_connect_after_client_connection_reaped() {
    let fabric = LoopbackFabric::new();
    let server = started(&fabric, true);
    server.listen(Address::localhost(12011)).unwrap();
    let client = started(&fabric, false);
    let conn = client.connect(Address::localhost(12011), 2000).unwrap();

    conn.shutdown();
    client.join().unwrap();
    assert!(matches!(
        conn.take_send_buffer(),
        Err(HpnlError::NotConnected(_))
    ));
    assert_eq!(client.send_pool().checked_out(), 0);

    let (done_tx, done_rx) = channel::bounded(1);
    let connecting = Arc::clone(&client);
    thread::spawn(move || {
        done_tx
            .send(connecting.connect(Address::localhost(12011), 0))
            .ok();
    });
    assert!(matches!(
        done_rx.recv_timeout(WAIT).unwrap(),
        Err(HpnlError::NotRunning)
    ));

    server.stop();
    server.join().unwrap();
}

#[test]
fn test_unbounded_connect_to_listener() {
    let fabric = LoopbackFabric::new();
    let server = started(&fabric, true);
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    server.set_callback(EventKind::Received, move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    server.listen(Address::localhost(12003)).unwrap();

    let client = started(&fabric, false);
    let conn = client.connect(Address::localhost(12003), 0).unwrap();
    assert!(conn.is_connected());
    assert_eq!(conn.posted_recv_count(), 4);
    assert_eq!(received.load(Ordering::SeqCst), 0);

    conn.shutdown();
    client.join().unwrap();
    server.stop();
    server.join().unwrap();
}

#[test]
fn test_double_shutdown_reaps_once() {
    let fabric = LoopbackFabric::new();
    let server = started(&fabric, true);
    let server_closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&server_closed);
    server.set_callback(EventKind::Shutdown, move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    server.listen(Address::localhost(12004)).unwrap();

    let client = started(&fabric, false);
    let client_closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&client_closed);
    client.set_callback(EventKind::Shutdown, move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let conn = client.connect(Address::localhost(12004), 2000).unwrap();

    assert!(conn.shutdown());
    assert!(!conn.shutdown());
    client.join().unwrap();

    assert_eq!(client_closed.load(Ordering::SeqCst), 1);
    assert!(wait_until(|| server_closed.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| server.connections().is_empty()));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(server_closed.load(Ordering::SeqCst), 1);
    assert!(client.connections().is_empty());
    assert_eq!(client.send_pool().checked_out(), 0);
    assert_eq!(client.recv_pool().checked_out(), 0);

    server.stop();
    server.join().unwrap();
}

#[test]
fn test_server_shutdown_stops_client() {
    let fabric = LoopbackFabric::new();
    let server = started(&fabric, true);
    server.set_callback(EventKind::Connected, |conn, _, _| {
        conn.shutdown();
    });
    server.listen(Address::localhost(12005)).unwrap();

    let client = started(&fabric, false);
    client.connect(Address::localhost(12005), 2000).unwrap();
    client.join().unwrap();
    assert!(!client.is_running());
    assert!(client.connections().is_empty());

    server.stop();
    server.join().unwrap();
}

#[test]
fn test_send_pool_growth() {
    let fabric = LoopbackFabric::new();
    let server = started(&fabric, true);
    server.listen(Address::localhost(12006)).unwrap();
    let client = started(&fabric, false);
    let conn = client.connect(Address::localhost(12006), 2000).unwrap();

    let taken: Vec<_> = (0..4).map(|_| conn.take_send_buffer().unwrap()).collect();
    assert!(matches!(
        conn.take_send_buffer(),
        Err(HpnlError::BufferPoolExhausted(_))
    ));
    client.send_pool().grow().unwrap();
    assert_eq!(client.send_pool().available(), 2);
    for buffer in &taken {
        assert!(client.send_pool().acquire(buffer.id()).is_ok());
    }
    assert!(conn.take_send_buffer().is_ok());

    conn.shutdown();
    client.join().unwrap();
    server.stop();
    server.join().unwrap();
}

#[test]
fn test_rma_read_of_advertised_buffer() {
    let fabric = LoopbackFabric::new();
    let exposed: Vec<u8> = (0..200u8).collect();

    let server = EventQueueService::new(config(true), fabric.transport()).unwrap();
    let (rma_id, _) = server
        .register_remote_access_buffer(exposed.clone(), 128)
        .unwrap();
    let descriptor = server
        .remote_access_buffer(rma_id)
        .unwrap()
        .remote_descriptor();
    server.set_callback(EventKind::Connected, move |conn, _, _| {
        conn.send_frame(9, 0, &descriptor.to_bytes()).unwrap();
    });
    server.start().unwrap();
    server.listen(Address::localhost(12007)).unwrap();

    let client = EventQueueService::new(config(false), fabric.transport()).unwrap();
    let local = client.allocate_remote_access_buffer(32).unwrap();
    let local_id = local.id();
    client.set_callback(EventKind::Received, move |conn, id, len| {
        let frame = conn.recv_buffer(id).unwrap().parse(len).unwrap();
        let remote = RemoteBuffer::from_bytes(&frame.payload).unwrap();
        let window = remote.subrange(100, 32).unwrap();
        conn.read(local_id, &window, 32).unwrap();
    });
    let (read_tx, read_rx) = channel::unbounded();
    client.set_callback(EventKind::Read, move |conn, id, len| {
        let buffer = conn.rma_buffer(id).unwrap();
        read_tx.send(buffer.region().copy_out(0, len).unwrap()).unwrap();
    });
    client.start().unwrap();
    let conn = client.connect(Address::localhost(12007), 2000).unwrap();

    let bytes = read_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(bytes, exposed[100..132].to_vec());

    // Only the first 128 bytes were registered.
    let beyond = RemoteBuffer::new(descriptor.addr + 120, 16, descriptor.rkey);
    assert!(matches!(
        conn.read(local_id, &beyond, 16),
        Err(HpnlError::Transport(_))
    ));

    conn.shutdown();
    client.join().unwrap();
    server.stop();
    server.join().unwrap();
}

#[test]
fn test_fatal_transport_error_terminates_loop() {
    let fabric = LoopbackFabric::new();
    let server = started(&fabric, true);
    server.listen(Address::localhost(12008)).unwrap();
    let client = started(&fabric, false);

    let connecting = Arc::clone(&client);
    let pending = thread::spawn(move || connecting.connect(Address::localhost(12999), 0));
    assert!(wait_until(|| client.pending_connects() == 1));

    fabric.inject_fatal("device removed");

    assert!(matches!(server.join(), Err(HpnlError::LoopTerminated(_))));
    assert!(matches!(client.join(), Err(HpnlError::LoopTerminated(_))));
    assert!(matches!(
        pending.join().unwrap(),
        Err(HpnlError::LoopTerminated(reason)) if reason.contains("device removed")
    ));
    assert!(server.termination().is_some());
    assert!(matches!(
        server.listen(Address::localhost(12009)),
        Err(HpnlError::LoopTerminated(_))
    ));
    assert!(matches!(
        client.connect(Address::localhost(12008), 100),
        Err(HpnlError::LoopTerminated(_))
    ));
}
