// SPDX-License-Identifier: Apache-2.0

//! A [`Transport`] over a split [`tokio::net::TcpStream`].
//!
//! Structure is ported from `ClientConnection`
//! (`client/client.rs`): an owned read half and write half, each behind
//! its own [`tokio::sync::Mutex`] so reads never block writes and vice
//! versa, plus a [`CancellationToken`] that aborts both paths on close.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::transport::Transport;

/// A single TCP connection used as an RPC transport.
#[derive(Debug)]
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
}

impl TcpTransport {
    /// Connect to `addr` and wrap the resulting stream.
    pub async fn connect(addr: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RpcError::SendFailed(format!("connect to {addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-accepted stream (server side).
    pub fn from_stream(stream: TcpStream) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: Mutex::new(r),
            writer: Mutex::new(w),
            cancel: CancellationToken::new(),
        }
    }

    /// The token that [`Transport::close`] cancels; exposed so the
    /// server loop can select on it when tearing down a connection.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), RpcError> {
        let mut w = self.writer.lock().await;
        w.write_all(bytes)
            .await
            .map_err(|e| RpcError::SendFailed(e.to_string()))
    }

    async fn read(&self, max: usize) -> Result<Bytes, RpcError> {
        let mut buf = BytesMut::with_capacity(max.min(64 * 1024));
        buf.resize(max.min(64 * 1024), 0);
        let mut r = self.reader.lock().await;
        let n = r.read(&mut buf).await.map_err(|e| {
            tracing::debug!(error = %e, "tcp read ended");
            RpcError::ChannelClosed
        })?;
        if n == 0 {
            return Err(RpcError::ChannelClosed);
        }
        buf.truncate(n);
        Ok(buf.freeze())
    }

    async fn read_exact(&self, n: usize) -> Result<Bytes, RpcError> {
        let mut buf = BytesMut::with_capacity(n);
        buf.resize(n, 0);
        let mut r = self.reader.lock().await;
        r.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                RpcError::ChannelClosed
            } else {
                RpcError::SendFailed(e.to_string())
            }
        })?;
        Ok(buf.freeze())
    }

    async fn close(&self) {
        self.cancel.cancel();
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }
}
