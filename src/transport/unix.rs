// SPDX-License-Identifier: Apache-2.0

//! A [`Transport`] over a split [`tokio::net::UnixStream`], structured
//! identically to [`crate::transport::TcpTransport`] — same split
//! reader/writer mutex pair, same cancellation-on-close behavior — for
//! the `unix://` scheme [`crate::url::ServiceUrl`] accepts.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::transport::Transport;

/// A single Unix domain socket connection used as an RPC transport.
#[derive(Debug)]
pub struct UnixTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
}

impl UnixTransport {
    /// Connect to the socket at `path`.
    pub async fn connect(path: &str) -> Result<Self, RpcError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| RpcError::SendFailed(format!("connect to {path}: {e}")))?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-accepted stream (server side).
    pub fn from_stream(stream: UnixStream) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: Mutex::new(r),
            writer: Mutex::new(w),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), RpcError> {
        let mut w = self.writer.lock().await;
        w.write_all(bytes).await.map_err(|e| RpcError::SendFailed(e.to_string()))
    }

    async fn read(&self, max: usize) -> Result<Bytes, RpcError> {
        let mut buf = BytesMut::with_capacity(max.min(64 * 1024));
        buf.resize(max.min(64 * 1024), 0);
        let mut r = self.reader.lock().await;
        let n = r.read(&mut buf).await.map_err(|e| {
            tracing::debug!(error = %e, "unix read ended");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_bytes_over_a_real_socket_pair() {
        let dir = std::env::temp_dir().join(format!("pebble-unix-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).expect("tempdir");
        let path = dir.join("pebble.sock");
        let path_str = path.to_str().expect("utf8 path").to_string();
        let _ = std::fs::remove_file(&path);

        let listener = tokio::net::UnixListener::bind(&path).expect("bind");
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            UnixTransport::from_stream(stream)
        });

        let client = UnixTransport::connect(&path_str).await.expect("connect");
        let server = accept.await.expect("accept task");

        client.write(b"hello unix").await.expect("write");
        let got = server.read_exact(10).await.expect("read");
        assert_eq!(got.as_ref(), b"hello unix");

        std::fs::remove_dir_all(&dir).ok();
    }
}
