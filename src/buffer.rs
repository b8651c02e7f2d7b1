// SPDX-License-Identifier: Apache-2.0

//! Observer/owner memory buffer used between a [`crate::codec`] and a
//! [`crate::transport::Transport`].
//!
//! Observer mode wraps a caller-supplied byte range without copying; it
//! exists for the hot encode path where the caller already holds a
//! contiguous slice (e.g. a received frame). Owner mode grows
//! geometrically up to [`OWNED_BUFFER_CAP`]. Collapsing the two modes
//! into a single growable buffer (§9 Design Notes) is a valid
//! alternative implementation; this crate keeps the distinction because
//! the codec tests rely on observer mode's overflow behaviour.

use bytes::{Bytes, BytesMut};

use crate::error::RpcError;

/// Hard cap on owner-mode growth, matching spec.md §4.1.
pub const OWNED_BUFFER_CAP: usize = 8 * 1024 * 1024;

/// A read/write byte buffer shared between a transport and a codec.
#[derive(Debug)]
pub enum MemoryBuffer {
    /// Wraps a caller-supplied range. Never grows; overflow is an error.
    Observer { data: Bytes, pos: usize },
    /// Owns its storage and grows on demand, up to [`OWNED_BUFFER_CAP`].
    Owned { data: BytesMut, pos: usize },
}

impl MemoryBuffer {
    /// Wrap `bytes` in observer mode.
    pub fn observe(bytes: impl Into<Bytes>) -> Self {
        MemoryBuffer::Observer {
            data: bytes.into(),
            pos: 0,
        }
    }

    /// Create an empty owner-mode buffer with an initial capacity.
    pub fn owned(initial_cap: usize) -> Self {
        MemoryBuffer::Owned {
            data: BytesMut::with_capacity(initial_cap.min(OWNED_BUFFER_CAP)),
            pos: 0,
        }
    }

    /// Remaining unread bytes.
    pub fn remaining(&self) -> usize {
        match self {
            MemoryBuffer::Observer { data, pos } => data.len().saturating_sub(*pos),
            MemoryBuffer::Owned { data, pos } => data.len().saturating_sub(*pos),
        }
    }

    /// Borrow `len` bytes at the current read position without copying,
    /// or `None` if fewer than `len` bytes remain.
    pub fn borrow(&self, len: usize) -> Option<&[u8]> {
        match self {
            MemoryBuffer::Observer { data, pos } => data.get(*pos..*pos + len),
            MemoryBuffer::Owned { data, pos } => data.get(*pos..*pos + len),
        }
    }

    /// Advance the read position by `n` bytes.
    pub fn consume(&mut self, n: usize) {
        match self {
            MemoryBuffer::Observer { pos, .. } => *pos += n,
            MemoryBuffer::Owned { pos, .. } => *pos += n,
        }
    }

    /// Read exactly `len` bytes, copying them out and advancing the
    /// cursor. Fails with [`RpcError::BuffNotEnough`] on underrun.
    pub fn read_exact(&mut self, len: usize) -> Result<Bytes, RpcError> {
        let slice = self.borrow(len).ok_or(RpcError::BuffNotEnough)?.to_vec();
        self.consume(len);
        Ok(Bytes::from(slice))
    }

    /// Append `bytes` to the buffer.
    ///
    /// Observer-mode buffers never grow: any append is an overflow.
    /// Owner-mode buffers grow to `next_power_of_two(required)`, capped
    /// at [`OWNED_BUFFER_CAP`]; growth that would still overflow the cap
    /// fails with [`RpcError::BuffNotEnough`].
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        match self {
            MemoryBuffer::Observer { .. } => Err(RpcError::BuffNotEnough),
            MemoryBuffer::Owned { data, .. } => {
                let required = data.len() + bytes.len();
                if required > data.capacity() {
                    let grown = required.next_power_of_two();
                    if grown > OWNED_BUFFER_CAP {
                        if required > OWNED_BUFFER_CAP {
                            return Err(RpcError::BuffNotEnough);
                        }
                        data.reserve(OWNED_BUFFER_CAP - data.len());
                    } else {
                        data.reserve(grown - data.len());
                    }
                }
                data.extend_from_slice(bytes);
                Ok(())
            },
        }
    }

    /// Consume the buffer and return all written/remaining bytes.
    pub fn into_bytes(self) -> Bytes {
        match self {
            MemoryBuffer::Observer { data, .. } => data,
            MemoryBuffer::Owned { data, .. } => data.freeze(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observer_overflow_is_buff_not_enough() {
        let mut buf = MemoryBuffer::observe(Bytes::from_static(b"ab"));
        assert_eq!(buf.read_exact(2).unwrap().as_ref(), b"ab");
        assert_eq!(buf.read_exact(1).unwrap_err(), RpcError::BuffNotEnough);
    }

    #[test]
    fn owned_grows_geometrically() {
        let mut buf = MemoryBuffer::owned(1);
        buf.write(&[0u8; 10]).unwrap();
        if let MemoryBuffer::Owned { data, .. } = &buf {
            assert!(data.capacity() >= 16);
        } else {
            panic!("expected owned buffer");
        }
    }

    #[test]
    fn owned_growth_past_cap_fails() {
        let mut buf = MemoryBuffer::owned(1);
        let big = vec![0u8; OWNED_BUFFER_CAP + 1];
        assert_eq!(buf.write(&big).unwrap_err(), RpcError::BuffNotEnough);
    }

    #[test]
    fn owned_roundtrip_read_write() {
        let mut buf = MemoryBuffer::owned(4);
        buf.write(b"hello").unwrap();
        let bytes = buf.into_bytes();
        assert_eq!(bytes.as_ref(), b"hello");
    }
}
