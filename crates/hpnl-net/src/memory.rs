//! Registered memory types.
//!
//! A [`MemoryRegion`] is the storage behind one buffer. It is allocated once
//! and never resized, so the address a provider registers stays valid for the
//! region's lifetime.

use std::fmt;

use hpnl_types::RemoteKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Which pool a buffer belongs to, and so which operations it may back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferRole {
    Send,
    Recv,
    /// Remotely accessible region (RMA source or target).
    Rma,
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferRole::Send => write!(f, "SEND"),
            BufferRole::Recv => write!(f, "RECV"),
            BufferRole::Rma => write!(f, "RMA"),
        }
    }
}

/// Fixed-size, address-stable byte storage shared between a pool and the
/// transport that registered it.
pub struct MemoryRegion {
    data: Mutex<Box<[u8]>>,
    addr: u64,
    len: usize,
}

impl MemoryRegion {
    /// Allocate a zero-filled region.
    pub fn zeroed(len: usize) -> Self {
        Self::from_boxed(vec![0u8; len].into_boxed_slice())
    }

    /// Take ownership of caller-provided bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::from_boxed(data.into_boxed_slice())
    }

    fn from_boxed(data: Box<[u8]>) -> Self {
        let addr = data.as_ptr() as usize as u64;
        let len = data.len();
        Self {
            data: Mutex::new(data),
            addr,
            len,
        }
    }

    /// Start address of the storage, as a provider would register it.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run `f` over the region's bytes.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock())
    }

    /// Run `f` over the region's bytes, mutably.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock())
    }

    /// Copy `len` bytes starting at `offset`, or `None` if out of range.
    pub fn copy_out(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        self.read(|bytes| bytes.get(offset..end).map(<[u8]>::to_vec))
    }

    /// Copy `src` into the region at `offset`. Returns `false` if it does not fit.
    pub fn copy_in(&self, offset: usize, src: &[u8]) -> bool {
        let Some(end) = offset.checked_add(src.len()) else {
            return false;
        };
        self.write(|bytes| match bytes.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        })
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .finish()
    }
}

/// Size of [`RemoteBuffer::to_bytes`] output.
pub const REMOTE_BUFFER_WIRE_SIZE: usize = 24;

/// Everything a peer needs to access a registered region with RMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBuffer {
    /// Remote memory address.
    pub addr: u64,
    /// Length of the accessible range in bytes.
    pub len: u64,
    /// Key granted at registration.
    pub rkey: RemoteKey,
}

impl RemoteBuffer {
    pub fn new(addr: u64, len: u64, rkey: RemoteKey) -> Self {
        Self { addr, len, rkey }
    }

    /// A sub-range of this buffer, or `None` if it does not fit.
    pub fn subrange(&self, offset: u64, len: u64) -> Option<Self> {
        if offset.checked_add(len)? > self.len {
            return None;
        }
        Some(Self {
            addr: self.addr.checked_add(offset)?,
            len,
            rkey: self.rkey,
        })
    }

    /// Encode as `[addr][len][rkey]`, big-endian, so it can ride in a message.
    pub fn to_bytes(&self) -> [u8; REMOTE_BUFFER_WIRE_SIZE] {
        let mut out = [0u8; REMOTE_BUFFER_WIRE_SIZE];
        out[0..8].copy_from_slice(&self.addr.to_be_bytes());
        out[8..16].copy_from_slice(&self.len.to_be_bytes());
        out[16..24].copy_from_slice(&self.rkey.raw().to_be_bytes());
        out
    }

    /// Decode the output of [`RemoteBuffer::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let field = |i: usize| -> Option<u64> {
            let raw: [u8; 8] = data.get(i * 8..i * 8 + 8)?.try_into().ok()?;
            Some(u64::from_be_bytes(raw))
        };
        Some(Self {
            addr: field(0)?,
            len: field(1)?,
            rkey: RemoteKey(field(2)?),
        })
    }
}
