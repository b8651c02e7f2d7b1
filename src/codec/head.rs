// SPDX-License-Identifier: Apache-2.0

//! Message head dialects, ported from `ThriftRpcPlugin`/`ProtoBufRpcPlugin`
//! (`examples/original_source/src/framework/rpc_plugin.cpp`) and
//! `ProtoBufRpcHead` (`examples/original_source/src/framework/protobuf_rpc_head.h`,
//! not carried into this pack — its field layout is reconstructed here
//! from the encode order in `rpc_plugin.cpp`).
//!
//! `Thrift` framing has no head distinct from the body codec: the name,
//! message type and session id are exactly what the negotiated
//! [`Protocol`]'s `message_begin`/`message_end` already carries.
//! `Protobuf` framing decouples the two — the head is a small struct
//! always encoded with [`BinaryCodec`], independent of whatever
//! `Protocol` the body uses; the body itself is then just a bare
//! struct (`write_struct_begin`/`write_struct_end`, no message
//! wrapper).

use bytes::Bytes;

use crate::buffer::MemoryBuffer;
use crate::codec::binary::BinaryCodec;
use crate::codec::{Field, MessageType, Protocol, TType, Value, decode_value, encode_value};
use crate::error::RpcError;

const PB_HEAD_VERSION: i32 = 1;
const PB_FIELD_VERSION: i16 = 1;
const PB_FIELD_MSG_TYPE: i16 = 2;
const PB_FIELD_SESSION_ID: i16 = 3;
const PB_FIELD_FUNCTION_NAME: i16 = 4;

/// Which on-wire dialect frames a message's name/type/session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadDialect {
    Thrift,
    Protobuf,
}

impl HeadDialect {
    pub fn codec(self) -> Box<dyn HeadCodec> {
        match self {
            HeadDialect::Thrift => Box::new(ThriftHead),
            HeadDialect::Protobuf => Box::new(ProtobufHead),
        }
    }
}

/// Frames a message's envelope (name, type, session id) around a body
/// encoded separately through the connection's negotiated [`Protocol`].
pub trait HeadCodec: Send + Sync {
    fn write_head(
        &self,
        body: &mut dyn Protocol,
        buf: &mut MemoryBuffer,
        name: &str,
        mtype: MessageType,
        session_id: u64,
    ) -> Result<(), RpcError>;
    fn write_tail(&self, body: &mut dyn Protocol, buf: &mut MemoryBuffer) -> Result<(), RpcError>;
    fn read_head(
        &self,
        body: &mut dyn Protocol,
        buf: &mut MemoryBuffer,
    ) -> Result<(String, MessageType, u64), RpcError>;
    fn read_tail(&self, body: &mut dyn Protocol, buf: &mut MemoryBuffer) -> Result<(), RpcError>;
}

/// Delegates straight to the body [`Protocol`]'s own message framing.
pub struct ThriftHead;

impl HeadCodec for ThriftHead {
    fn write_head(
        &self,
        body: &mut dyn Protocol,
        buf: &mut MemoryBuffer,
        name: &str,
        mtype: MessageType,
        session_id: u64,
    ) -> Result<(), RpcError> {
        body.write_message_begin(buf, name, mtype, session_id)
    }

    fn write_tail(&self, body: &mut dyn Protocol, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        body.write_message_end(buf)
    }

    fn read_head(
        &self,
        body: &mut dyn Protocol,
        buf: &mut MemoryBuffer,
    ) -> Result<(String, MessageType, u64), RpcError> {
        body.read_message_begin(buf)
    }

    fn read_tail(&self, body: &mut dyn Protocol, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        body.read_message_end(buf)
    }
}

/// A standalone head struct always carried over [`BinaryCodec`],
/// independent of the negotiated body `Protocol`.
pub struct ProtobufHead;

impl HeadCodec for ProtobufHead {
    fn write_head(
        &self,
        _body: &mut dyn Protocol,
        buf: &mut MemoryBuffer,
        name: &str,
        mtype: MessageType,
        session_id: u64,
    ) -> Result<(), RpcError> {
        let mut head_proto = BinaryCodec;
        let head = Value::Struct(vec![
            Field {
                id: PB_FIELD_VERSION,
                value: Value::I32(PB_HEAD_VERSION),
            },
            Field {
                id: PB_FIELD_MSG_TYPE,
                value: Value::Byte(mtype as i8),
            },
            Field {
                id: PB_FIELD_SESSION_ID,
                value: Value::I64(session_id as i64),
            },
            Field {
                id: PB_FIELD_FUNCTION_NAME,
                value: Value::Str(name.to_string()),
            },
        ]);
        encode_value(&mut head_proto, buf, &head)
    }

    fn write_tail(&self, _body: &mut dyn Protocol, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn read_head(
        &self,
        _body: &mut dyn Protocol,
        buf: &mut MemoryBuffer,
    ) -> Result<(String, MessageType, u64), RpcError> {
        let mut head_proto = BinaryCodec;
        let value = decode_value(&mut head_proto, buf, TType::Struct)?;
        let Value::Struct(fields) = value else {
            return Err(RpcError::DecodeHeadFailed("protobuf head is not a struct".into()));
        };
        let mut mtype = None;
        let mut session_id = None;
        let mut name = None;
        for field in fields {
            match field.id {
                PB_FIELD_MSG_TYPE => {
                    if let Value::Byte(v) = field.value {
                        mtype = Some(MessageType::try_from(v)?);
                    }
                },
                PB_FIELD_SESSION_ID => {
                    if let Value::I64(v) = field.value {
                        session_id = Some(v as u64);
                    }
                },
                PB_FIELD_FUNCTION_NAME => {
                    if let Value::Str(v) = field.value {
                        name = Some(v);
                    }
                },
                _ => {},
            }
        }
        let mtype = mtype.ok_or_else(|| RpcError::DecodeHeadFailed("protobuf head missing msg_type".into()))?;
        let session_id =
            session_id.ok_or_else(|| RpcError::DecodeHeadFailed("protobuf head missing session_id".into()))?;
        let name = name.ok_or_else(|| RpcError::DecodeHeadFailed("protobuf head missing function_name".into()))?;
        Ok((name, mtype, session_id))
    }

    fn read_tail(&self, _body: &mut dyn Protocol, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }
}

/// `{ type: i32, message: String }`, encoded with whatever `Protocol`
/// frames the rest of this message — per spec.md §4.3, exceptions
/// always ride the body codec, never the head dialect's own codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcException {
    pub error_code: i32,
    pub message: String,
}

const EXC_FIELD_TYPE: i16 = 1;
const EXC_FIELD_MESSAGE: i16 = 2;

impl RpcException {
    pub fn encode(&self, body: &mut dyn Protocol, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        let value = Value::Struct(vec![
            Field {
                id: EXC_FIELD_TYPE,
                value: Value::I32(self.error_code),
            },
            Field {
                id: EXC_FIELD_MESSAGE,
                value: Value::Str(self.message.clone()),
            },
        ]);
        encode_value(body, buf, &value)
    }

    pub fn decode(body: &mut dyn Protocol, buf: &mut MemoryBuffer) -> Result<Self, RpcError> {
        let value = decode_value(body, buf, TType::Struct)?;
        let Value::Struct(fields) = value else {
            return Err(RpcError::DecodeBodyFailed("rpc exception is not a struct".into()));
        };
        let mut error_code = None;
        let mut message = None;
        for field in fields {
            match field.id {
                EXC_FIELD_TYPE => {
                    if let Value::I32(v) = field.value {
                        error_code = Some(v);
                    }
                },
                EXC_FIELD_MESSAGE => {
                    if let Value::Str(v) = field.value {
                        message = Some(v);
                    }
                },
                _ => {},
            }
        }
        Ok(RpcException {
            error_code: error_code.unwrap_or(0),
            message: message.unwrap_or_default(),
        })
    }
}

/// Encoded bytes for a just-built message head, used by the RPC core
/// when it needs to measure a head before appending the body.
pub fn head_bytes(
    dialect: &dyn HeadCodec,
    body: &mut dyn Protocol,
    name: &str,
    mtype: MessageType,
    session_id: u64,
) -> Result<Bytes, RpcError> {
    let mut buf = MemoryBuffer::owned(64);
    dialect.write_head(body, &mut buf, name, mtype, session_id)?;
    Ok(buf.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::binary::BinaryCodec;
    use crate::codec::json::JsonCodec;

    #[test]
    fn thrift_head_round_trips_over_binary() {
        let dialect = ThriftHead;
        let mut body = BinaryCodec;
        let mut out = MemoryBuffer::owned(64);
        dialect
            .write_head(&mut body, &mut out, "Echo:say", MessageType::Call, 7)
            .expect("write head");
        body.write_struct_begin(&mut out).expect("struct begin");
        body.write_field_stop(&mut out).expect("field stop");
        body.write_struct_end(&mut out).expect("struct end");
        dialect.write_tail(&mut body, &mut out).expect("write tail");

        let mut input = MemoryBuffer::observe(out.into_bytes());
        let (name, mtype, sid) = dialect.read_head(&mut body, &mut input).expect("read head");
        assert_eq!(name, "Echo:say");
        assert_eq!(mtype, MessageType::Call);
        assert_eq!(sid, 7);
        body.read_struct_begin(&mut input).expect("struct begin");
        let (ftype, _) = body.read_field_begin(&mut input).expect("field begin");
        assert_eq!(ftype, TType::Stop);
        body.read_struct_end(&mut input).expect("struct end");
        dialect.read_tail(&mut body, &mut input).expect("read tail");
    }

    #[test]
    fn thrift_head_round_trips_over_json() {
        let dialect = ThriftHead;
        let mut body = JsonCodec::default();
        let mut out = MemoryBuffer::owned(64);
        dialect
            .write_head(&mut body, &mut out, "Echo:say", MessageType::Reply, 9)
            .expect("write head");
        encode_value(&mut body, &mut out, &Value::Struct(vec![])).expect("encode body");
        dialect.write_tail(&mut body, &mut out).expect("write tail");

        let mut input = MemoryBuffer::observe(out.into_bytes());
        let (name, mtype, sid) = dialect.read_head(&mut body, &mut input).expect("read head");
        assert_eq!(name, "Echo:say");
        assert_eq!(mtype, MessageType::Reply);
        assert_eq!(sid, 9);
    }

    #[test]
    fn protobuf_head_is_independent_of_body_codec() {
        let dialect = ProtobufHead;
        let mut unused_body = BinaryCodec;
        let mut out = MemoryBuffer::owned(64);
        dialect
            .write_head(&mut unused_body, &mut out, "Echo:say", MessageType::Oneway, 123)
            .expect("write head");
        // body is a bare struct, no message wrapper from the head dialect
        unused_body.write_struct_begin(&mut out).expect("struct begin");
        unused_body.write_field_stop(&mut out).expect("field stop");
        unused_body.write_struct_end(&mut out).expect("struct end");

        let mut input = MemoryBuffer::observe(out.into_bytes());
        let (name, mtype, sid) = dialect.read_head(&mut unused_body, &mut input).expect("read head");
        assert_eq!(name, "Echo:say");
        assert_eq!(mtype, MessageType::Oneway);
        assert_eq!(sid, 123);
    }

    #[test]
    fn rpc_exception_round_trips() {
        let mut body = BinaryCodec;
        let mut out = MemoryBuffer::owned(64);
        let exc = RpcException {
            error_code: -42,
            message: "unknown method".into(),
        };
        exc.encode(&mut body, &mut out).expect("encode");
        let mut input = MemoryBuffer::observe(out.into_bytes());
        let decoded = RpcException::decode(&mut body, &mut input).expect("decode");
        assert_eq!(decoded, exc);
    }
}
