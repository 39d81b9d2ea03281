//! Registered buffers and the frame metadata header.
//!
//! A frame is `[type: u8][connection id: u64][sequence: u64][payload]`, with
//! big-endian integers. The header is optional for raw transfers: callers
//! that only move bytes can use [`MemoryBuffer::with_bytes_mut`] and
//! [`MemoryBuffer::set_len`] directly.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};
use hpnl_net::{BufferRole, MemoryRegion, RemoteBuffer};
use hpnl_types::{BufferId, RemoteKey};
use parking_lot::Mutex;

use crate::error::{HpnlError, Result};

/// Size of the encoded [`FrameHeader`].
pub const METADATA_SIZE: usize = 1 + 8 + 8;

/// Metadata carried in front of every framed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameHeader {
    pub frame_type: u8,
    pub connection_id: u64,
    pub seq: u64,
}

impl FrameHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.frame_type);
        buf.put_u64(self.connection_id);
        buf.put_u64(self.seq);
    }

    /// Decode a header, or `None` if fewer than [`METADATA_SIZE`] bytes remain.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < METADATA_SIZE {
            return None;
        }
        Some(Self {
            frame_type: buf.get_u8(),
            connection_id: buf.get_u64(),
            seq: buf.get_u64(),
        })
    }
}

/// A received frame split into header and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct FrameState {
    len: usize,
    connection_id: u64,
    peer_connection_id: Option<u64>,
}

/// One registered, fixed-capacity buffer owned by a pool.
pub struct MemoryBuffer {
    id: BufferId,
    role: BufferRole,
    region: Arc<MemoryRegion>,
    rkey: RemoteKey,
    state: Mutex<FrameState>,
}

impl MemoryBuffer {
    pub(crate) fn new(
        id: BufferId,
        role: BufferRole,
        region: Arc<MemoryRegion>,
        rkey: RemoteKey,
    ) -> Self {
        Self {
            id,
            role,
            region,
            rkey,
            state: Mutex::new(FrameState::default()),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    pub fn remote_key(&self) -> RemoteKey {
        self.rkey
    }

    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    /// What a peer needs to read this buffer with RMA.
    pub fn remote_descriptor(&self) -> RemoteBuffer {
        RemoteBuffer::new(self.region.addr(), self.capacity() as u64, self.rkey)
    }

    /// Current frame length in bytes.
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_len(&self, len: usize) -> Result<()> {
        if len > self.capacity() {
            return Err(HpnlError::InvalidLength {
                len,
                capacity: self.capacity(),
            });
        }
        self.state.lock().len = len;
        Ok(())
    }

    pub fn connection_id(&self) -> u64 {
        self.state.lock().connection_id
    }

    /// Id stamped into every header written by this buffer.
    pub fn set_connection_id(&self, id: u64) {
        self.state.lock().connection_id = id;
    }

    /// Connection id found in the last parsed header.
    pub fn peer_connection_id(&self) -> Option<u64> {
        self.state.lock().peer_connection_id
    }

    /// Write header and payload, returning the frame length.
    pub fn put_data(&self, frame_type: u8, seq: u64, payload: &[u8]) -> Result<usize> {
        let len = METADATA_SIZE + payload.len();
        if len > self.capacity() {
            return Err(HpnlError::PayloadTooLarge {
                len: payload.len(),
                capacity: self.capacity(),
            });
        }
        let mut state = self.state.lock();
        let header = FrameHeader {
            frame_type,
            connection_id: state.connection_id,
            seq,
        };
        self.region.write(|bytes| {
            let mut dst = &mut bytes[..len];
            header.encode(&mut dst);
            dst.put_slice(payload);
        });
        state.len = len;
        Ok(len)
    }

    /// Copy `data` into the payload area at `offset` past the header.
    pub fn write_payload(&self, offset: usize, data: &[u8]) -> Result<()> {
        let start = METADATA_SIZE.saturating_add(offset);
        if !self.region.copy_in(start, data) {
            return Err(HpnlError::PayloadTooLarge {
                len: offset.saturating_add(data.len()),
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    /// Run `f` over the whole backing storage, header area included.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.region.write(f)
    }

    /// Stamp a header over a payload that was written in place and set the
    /// frame length to `limit`.
    pub fn insert_metadata(&self, frame_type: u8, seq: u64, limit: usize) -> Result<()> {
        if limit < METADATA_SIZE || limit > self.capacity() {
            return Err(HpnlError::InvalidLength {
                len: limit,
                capacity: self.capacity(),
            });
        }
        let mut state = self.state.lock();
        let header = FrameHeader {
            frame_type,
            connection_id: state.connection_id,
            seq,
        };
        self.region.write(|bytes| {
            let mut dst = &mut bytes[..METADATA_SIZE];
            header.encode(&mut dst);
        });
        state.len = limit;
        Ok(())
    }

    /// Split the first `len` bytes into header and payload.
    pub fn parse(&self, len: usize) -> Result<ParsedFrame> {
        if len < METADATA_SIZE || len > self.capacity() {
            return Err(HpnlError::InvalidLength {
                len,
                capacity: self.capacity(),
            });
        }
        let mut frame = Bytes::from(self.region.read(|bytes| bytes[..len].to_vec()));
        let header = FrameHeader::decode(&mut frame).ok_or(HpnlError::InvalidLength {
            len,
            capacity: self.capacity(),
        })?;
        let mut state = self.state.lock();
        state.len = len;
        state.peer_connection_id = Some(header.connection_id);
        Ok(ParsedFrame {
            header,
            payload: frame,
        })
    }

    /// Copy of the first `len()` bytes, without interpreting a header.
    pub fn contents(&self) -> Bytes {
        let len = self.len();
        Bytes::from(self.region.read(|bytes| bytes[..len].to_vec()))
    }

    /// Forget the current frame. The stamped connection id is kept.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.len = 0;
        state.peer_connection_id = None;
    }
}

impl fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
