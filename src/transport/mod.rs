// SPDX-License-Identifier: Apache-2.0

//! Byte-oriented full-duplex channels named by a [`crate::handle::Handle`].

mod frame;
mod tcp;
mod unix;

pub use frame::FrameCodec;
pub use tcp::TcpTransport;
pub use unix::UnixTransport;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::RpcError;

/// The contract a [`crate::codec::Protocol`] relies on to move bytes.
///
/// Implementations must not be shared across concurrent encoders or
/// decoders without external synchronization (spec.md §4.2): this
/// crate enforces that by giving each connection its own `Arc<dyn
/// Transport>` and serializing writers internally (mirroring the
/// teacher's `Mutex<OwnedWriteHalf>` pattern).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write `bytes` in full. A short write is a framework bug in the
    /// underlying socket layer and is reported as
    /// [`RpcError::SendFailed`] rather than silently truncated.
    async fn write(&self, bytes: &[u8]) -> Result<(), RpcError>;

    /// Read up to `max` bytes.
    async fn read(&self, max: usize) -> Result<Bytes, RpcError>;

    /// Read exactly `n` bytes, looping internally until satisfied or the
    /// channel closes.
    async fn read_exact(&self, n: usize) -> Result<Bytes, RpcError>;

    /// Tear down the channel. Implementations should be idempotent.
    async fn close(&self);
}
