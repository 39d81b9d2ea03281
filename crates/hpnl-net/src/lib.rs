//! Transport abstraction for the HPNL management layer.
//!
//! The management layer in `hpnl-core` never talks to verbs directly. It drives
//! a [`Transport`]: something that can create event queues by connecting or
//! listening, register memory, post send/receive/RMA work and report
//! completions. Providers live in their own crates (e.g. `hpnl-net-loopback`).
//!
//! # Types
//!
//! - [`Completion`] / [`EventKind`]: what a poll yields.
//! - [`MemoryRegion`]: address-stable memory handed to the provider.
//! - [`RemoteBuffer`]: what a peer needs to read a registered region.
//! - [`TransportError`]: provider failures, split into fatal and recoverable.

pub mod error;
pub mod event;
pub mod memory;
pub mod transport;

pub use error::TransportError;
pub use event::{Completion, EventKind};
pub use memory::{BufferRole, MemoryRegion, RemoteBuffer, REMOTE_BUFFER_WIRE_SIZE};
pub use transport::{ConnectionInfo, Transport};
