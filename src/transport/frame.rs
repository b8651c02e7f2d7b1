// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed framing over a stream [`Transport`].
//!
//! spec.md §6: "the reference implementation uses a 4-byte big-endian
//! length prefix before the codec-produced bytes." `tokio_util`'s
//! `LengthDelimitedCodec` already speaks exactly that wire format, so
//! the frame layer here is a thin helper around it plus our own
//! [`Transport`] trait rather than a hand-rolled parser.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::RpcError;
use crate::transport::Transport;

const LENGTH_FIELD_BYTES: usize = 4;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encodes/decodes whole logical messages (codec-produced bytes) as
/// length-prefixed frames on top of any [`Transport`].
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_FIELD_BYTES)
            .big_endian()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        Self { inner }
    }

    /// Prefix `payload` with its big-endian 4-byte length and write it
    /// to `transport` as one logical message.
    pub async fn write_frame(
        &mut self,
        transport: &dyn Transport,
        payload: &[u8],
    ) -> Result<(), RpcError> {
        use tokio_util::codec::Encoder;
        let mut out = BytesMut::new();
        self.inner
            .encode(Bytes::copy_from_slice(payload), &mut out)
            .map_err(|e| RpcError::EncodeBodyFailed(e.to_string()))?;
        transport.write(&out).await
    }

    /// Read one complete logical message: a 4-byte big-endian length
    /// prefix followed by that many payload bytes.
    pub async fn read_frame(&mut self, transport: &dyn Transport) -> Result<Bytes, RpcError> {
        let len_buf = transport.read_exact(LENGTH_FIELD_BYTES).await?;
        let len = (&len_buf[..]).get_u32() as usize;
        if len > MAX_FRAME_LEN {
            return Err(RpcError::DecodeHeadFailed(format!(
                "frame length {len} exceeds cap {MAX_FRAME_LEN}"
            )));
        }
        transport.read_exact(len).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct LoopbackTransport {
        buf: Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn write(&self, bytes: &[u8]) -> Result<(), RpcError> {
            self.buf.lock().expect("lock").extend_from_slice(bytes);
            Ok(())
        }

        async fn read(&self, max: usize) -> Result<Bytes, RpcError> {
            self.read_exact(max).await
        }

        async fn read_exact(&self, n: usize) -> Result<Bytes, RpcError> {
            let mut buf = self.buf.lock().expect("lock");
            if buf.len() < n {
                return Err(RpcError::ChannelClosed);
            }
            let drained: Vec<u8> = buf.drain(..n).collect();
            Ok(Bytes::from(drained))
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn roundtrips_one_frame() {
        let transport = LoopbackTransport::default();
        let mut codec = FrameCodec::new();
        codec
            .write_frame(&transport, b"hello pebble")
            .await
            .expect("write");
        let got = codec.read_frame(&transport).await.expect("read");
        assert_eq!(got.as_ref(), b"hello pebble");
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let transport = LoopbackTransport::default();
        transport
            .write(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .expect("write len");
        let mut codec = FrameCodec::new();
        assert!(codec.read_frame(&transport).await.is_err());
    }
}
