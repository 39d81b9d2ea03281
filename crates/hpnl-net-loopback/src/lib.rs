//! In-process transport provider.
//!
//! Emulates an RDMA provider in user space so the management layer can run
//! without hardware: event queues are in-memory FIFOs, "registration" records
//! the region under its `(role, id)` and hands out a remote key, and sends copy
//! bytes straight into the peer's oldest posted receive buffer.
//!
//! A [`LoopbackFabric`] is the shared medium. Each service opens its own
//! [`LoopbackTransport`] on it, so a server and a client in one process see
//! each other's listeners but keep separate buffer namespaces.
//!
//! ```
//! use hpnl_net::Transport;
//! use hpnl_net_loopback::LoopbackFabric;
//! use hpnl_types::Address;
//!
//! let fabric = LoopbackFabric::new();
//! let server = fabric.transport();
//! let client = fabric.transport();
//! server.listen(Address::localhost(12345)).unwrap();
//! let eq = client.connect(Address::localhost(12345)).unwrap();
//! assert!(client.connection_info(eq).is_ok());
//! ```

mod fabric;
mod transport;

pub use fabric::LoopbackFabric;
pub use transport::LoopbackTransport;
