//! Connection and buffer management over a completion-queue transport.
//!
//! An [`EventQueueService`] owns a [`Transport`](hpnl_net::Transport), pools of
//! registered send/receive/RMA buffers and the mapping from event queues to
//! [`Connection`]s. Its [`EventPollingLoop`] polls every active queue on a
//! dedicated thread and dispatches completions to per-connection handlers.
//! Teardown is deferred: [`Connection::shutdown`] only queues the connection
//! on the [`ReapQueue`], which the loop drains.
//!
//! ```no_run
//! use hpnl_core::{EventQueueService, ServiceConfig};
//! use hpnl_net::EventKind;
//! use hpnl_net_loopback::LoopbackFabric;
//! use hpnl_types::Address;
//!
//! let fabric = LoopbackFabric::new();
//! let server = EventQueueService::new(ServiceConfig::server(), fabric.transport())?;
//! server.set_callback(EventKind::Received, |conn, id, len| {
//!     if let Ok(frame) = conn.recv_buffer(id).and_then(|buf| buf.parse(len)) {
//!         println!("{} bytes from {}", frame.payload.len(), conn.peer_addr());
//!     }
//! });
//! server.start()?;
//! server.listen(Address::localhost(12345))?;
//! # Ok::<(), hpnl_core::HpnlError>(())
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod poller;
pub mod pool;
pub mod reap;
pub mod service;

pub use buffer::{FrameHeader, MemoryBuffer, ParsedFrame, METADATA_SIZE};
pub use config::{ConfigError, ServiceConfig};
pub use connection::{Connection, ConnectionState, Handler, Handlers};
pub use error::{HpnlError, Result};
pub use poller::EventPollingLoop;
pub use pool::BufferPool;
pub use reap::ReapQueue;
pub use service::EventQueueService;
