// SPDX-License-Identifier: Apache-2.0

//! Typed-value encoding against a pluggable [`Protocol`].
//!
//! Three formats share one contract, ported from Thrift's `TProtocol`
//! (`examples/original_source/src/framework/dr/protocol/binary_protocol.h`)
//! and Pebble's own `dr` (dynamic reflection) layer
//! (`src/framework/dr/common/reflection.h`): `message_begin/end`,
//! `struct_begin/end`, `field_begin/end`, `map_begin/end`,
//! `list_begin/end`, `set_begin/end`, and typed scalar readers/writers.
//!
//! Because this crate has no IDL compiler, values are represented
//! dynamically by [`Value`] rather than by per-message generated
//! structs — the same role Pebble's `dr::reflection::TypeInfo` plays
//! for its own generic (de)serialization path. A generated stub in a
//! full Pebble deployment would walk a concrete struct's fields
//! instead of a `Value` tree; the wire encoding is identical either
//! way.

pub mod binary;
pub mod bson;
pub mod head;
pub mod json;

use bytes::Bytes;

use crate::buffer::MemoryBuffer;
use crate::error::RpcError;

/// Thrift-compatible wire type tags, ported verbatim from
/// `binary_protocol.h`'s `TType` values so that `Struct`/`Map`/`List`
/// framing lines up byte-for-byte with the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TType {
    Stop = 0,
    Bool = 2,
    Byte = 3,
    Double = 4,
    I16 = 6,
    I32 = 8,
    I64 = 10,
    String = 11,
    Struct = 12,
    Map = 13,
    Set = 14,
    List = 15,
}

impl TType {
    pub fn from_u8(b: u8) -> Result<Self, RpcError> {
        Ok(match b {
            0 => TType::Stop,
            2 => TType::Bool,
            3 => TType::Byte,
            4 => TType::Double,
            6 => TType::I16,
            8 => TType::I32,
            10 => TType::I64,
            11 => TType::String,
            12 => TType::Struct,
            13 => TType::Map,
            14 => TType::Set,
            15 => TType::List,
            other => return Err(RpcError::DecodeBodyFailed(format!("unknown TType {other}"))),
        })
    }
}

/// The message envelope's type, shared by the head codec and the RPC
/// core's dispatch switch (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl TryFrom<i8> for MessageType {
    type Error = RpcError;

    fn try_from(v: i8) -> Result<Self, RpcError> {
        Ok(match v {
            1 => MessageType::Call,
            2 => MessageType::Reply,
            3 => MessageType::Exception,
            4 => MessageType::Oneway,
            _ => return Err(RpcError::MessageTypeError),
        })
    }
}

/// One named field inside a [`Value::Struct`].
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub id: i16,
    pub value: Value,
}

/// A dynamically typed value that any of the three codecs can encode
/// or decode. Stands in for per-message generated structs (see module
/// docs).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Double(f64),
    Str(String),
    Binary(Bytes),
    Struct(Vec<Field>),
    Map(TType, TType, Vec<(Value, Value)>),
    List(TType, Vec<Value>),
    Set(TType, Vec<Value>),
}

impl Value {
    pub fn ttype(&self) -> TType {
        match self {
            Value::Bool(_) => TType::Bool,
            Value::Byte(_) => TType::Byte,
            Value::I16(_) => TType::I16,
            Value::I32(_) => TType::I32,
            Value::I64(_) => TType::I64,
            Value::Double(_) => TType::Double,
            Value::Str(_) | Value::Binary(_) => TType::String,
            Value::Struct(_) => TType::Struct,
            Value::Map(..) => TType::Map,
            Value::List(..) => TType::List,
            Value::Set(..) => TType::Set,
        }
    }
}

/// Hard ceilings from spec.md §4.2 / §8 invariant 1, shared by every
/// codec.
pub const MAX_STRING_LEN: usize = 8 * 1024 * 1024;
pub const MAX_CONTAINER_SIZE: usize = 8 * 1024 * 1024;

/// The per-format encode/decode contract. Methods take `&mut self`
/// because the JSON codec builds a tree incrementally and the BSON
/// codec keeps a bookmark stack for back-patched length prefixes;
/// per spec.md §4.2 a `Protocol` carries no thread-safety guarantee
/// and must not be shared across concurrent encoders/decoders.
pub trait Protocol: Send + Sync {
    fn write_message_begin(
        &mut self,
        buf: &mut MemoryBuffer,
        name: &str,
        mtype: MessageType,
        session_id: u64,
    ) -> Result<(), RpcError>;
    fn write_message_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;

    fn write_struct_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;
    fn write_struct_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;
    fn write_field_begin(
        &mut self,
        buf: &mut MemoryBuffer,
        ttype: TType,
        id: i16,
    ) -> Result<(), RpcError>;
    fn write_field_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;
    fn write_field_stop(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;

    fn write_map_begin(
        &mut self,
        buf: &mut MemoryBuffer,
        key: TType,
        val: TType,
        size: usize,
    ) -> Result<(), RpcError>;
    fn write_map_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;
    fn write_list_begin(
        &mut self,
        buf: &mut MemoryBuffer,
        elem: TType,
        size: usize,
    ) -> Result<(), RpcError>;
    fn write_list_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;
    fn write_set_begin(
        &mut self,
        buf: &mut MemoryBuffer,
        elem: TType,
        size: usize,
    ) -> Result<(), RpcError>;
    fn write_set_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;

    fn write_bool(&mut self, buf: &mut MemoryBuffer, v: bool) -> Result<(), RpcError>;
    fn write_byte(&mut self, buf: &mut MemoryBuffer, v: i8) -> Result<(), RpcError>;
    fn write_i16(&mut self, buf: &mut MemoryBuffer, v: i16) -> Result<(), RpcError>;
    fn write_i32(&mut self, buf: &mut MemoryBuffer, v: i32) -> Result<(), RpcError>;
    fn write_i64(&mut self, buf: &mut MemoryBuffer, v: i64) -> Result<(), RpcError>;
    fn write_double(&mut self, buf: &mut MemoryBuffer, v: f64) -> Result<(), RpcError>;
    fn write_string(&mut self, buf: &mut MemoryBuffer, v: &str) -> Result<(), RpcError>;
    fn write_binary(&mut self, buf: &mut MemoryBuffer, v: &[u8]) -> Result<(), RpcError>;

    fn read_message_begin(
        &mut self,
        buf: &mut MemoryBuffer,
    ) -> Result<(String, MessageType, u64), RpcError>;
    fn read_message_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;

    fn read_struct_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;
    fn read_struct_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;
    /// Returns `(TType::Stop, _)` when the struct has no more fields.
    fn read_field_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(TType, i16), RpcError>;
    fn read_field_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;

    fn read_map_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(TType, TType, usize), RpcError>;
    fn read_map_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;
    fn read_list_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(TType, usize), RpcError>;
    fn read_list_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;
    fn read_set_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(TType, usize), RpcError>;
    fn read_set_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError>;

    fn read_bool(&mut self, buf: &mut MemoryBuffer) -> Result<bool, RpcError>;
    fn read_byte(&mut self, buf: &mut MemoryBuffer) -> Result<i8, RpcError>;
    fn read_i16(&mut self, buf: &mut MemoryBuffer) -> Result<i16, RpcError>;
    fn read_i32(&mut self, buf: &mut MemoryBuffer) -> Result<i32, RpcError>;
    fn read_i64(&mut self, buf: &mut MemoryBuffer) -> Result<i64, RpcError>;
    fn read_double(&mut self, buf: &mut MemoryBuffer) -> Result<f64, RpcError>;
    fn read_string(&mut self, buf: &mut MemoryBuffer) -> Result<String, RpcError>;
    fn read_binary(&mut self, buf: &mut MemoryBuffer) -> Result<Bytes, RpcError>;
}

/// Recursively encode `value` against any [`Protocol`] implementation.
/// Shared by all three codecs so container/struct traversal logic is
/// written once.
pub fn encode_value(
    proto: &mut dyn Protocol,
    buf: &mut MemoryBuffer,
    value: &Value,
) -> Result<(), RpcError> {
    match value {
        Value::Bool(v) => proto.write_bool(buf, *v),
        Value::Byte(v) => proto.write_byte(buf, *v),
        Value::I16(v) => proto.write_i16(buf, *v),
        Value::I32(v) => proto.write_i32(buf, *v),
        Value::I64(v) => proto.write_i64(buf, *v),
        Value::Double(v) => proto.write_double(buf, *v),
        Value::Str(v) => proto.write_string(buf, v),
        Value::Binary(v) => proto.write_binary(buf, v),
        Value::Struct(fields) => {
            proto.write_struct_begin(buf)?;
            for field in fields {
                proto.write_field_begin(buf, field.value.ttype(), field.id)?;
                encode_value(proto, buf, &field.value)?;
                proto.write_field_end(buf)?;
            }
            proto.write_field_stop(buf)?;
            proto.write_struct_end(buf)
        },
        Value::Map(kt, vt, entries) => {
            if entries.len() > MAX_CONTAINER_SIZE {
                return Err(RpcError::EncodeBodyFailed("map too large".into()));
            }
            proto.write_map_begin(buf, *kt, *vt, entries.len())?;
            for (k, v) in entries {
                encode_value(proto, buf, k)?;
                encode_value(proto, buf, v)?;
            }
            proto.write_map_end(buf)
        },
        Value::List(et, items) => {
            if items.len() > MAX_CONTAINER_SIZE {
                return Err(RpcError::EncodeBodyFailed("list too large".into()));
            }
            proto.write_list_begin(buf, *et, items.len())?;
            for item in items {
                encode_value(proto, buf, item)?;
            }
            proto.write_list_end(buf)
        },
        Value::Set(et, items) => {
            if items.len() > MAX_CONTAINER_SIZE {
                return Err(RpcError::EncodeBodyFailed("set too large".into()));
            }
            proto.write_set_begin(buf, *et, items.len())?;
            for item in items {
                encode_value(proto, buf, item)?;
            }
            proto.write_set_end(buf)
        },
    }
}

/// Recursively decode a value of the expected `ttype` from `buf`.
pub fn decode_value(
    proto: &mut dyn Protocol,
    buf: &mut MemoryBuffer,
    ttype: TType,
) -> Result<Value, RpcError> {
    Ok(match ttype {
        TType::Stop => return Err(RpcError::DecodeBodyFailed("cannot decode T_STOP".into())),
        TType::Bool => Value::Bool(proto.read_bool(buf)?),
        TType::Byte => Value::Byte(proto.read_byte(buf)?),
        TType::I16 => Value::I16(proto.read_i16(buf)?),
        TType::I32 => Value::I32(proto.read_i32(buf)?),
        TType::I64 => Value::I64(proto.read_i64(buf)?),
        TType::Double => Value::Double(proto.read_double(buf)?),
        TType::String => Value::Str(proto.read_string(buf)?),
        TType::Struct => {
            proto.read_struct_begin(buf)?;
            let mut fields = Vec::new();
            loop {
                let (ftype, fid) = proto.read_field_begin(buf)?;
                if ftype == TType::Stop {
                    break;
                }
                let value = decode_value(proto, buf, ftype)?;
                proto.read_field_end(buf)?;
                fields.push(Field { id: fid, value });
            }
            proto.read_struct_end(buf)?;
            Value::Struct(fields)
        },
        TType::Map => {
            let (kt, vt, size) = proto.read_map_begin(buf)?;
            if size > MAX_CONTAINER_SIZE {
                return Err(RpcError::DecodeBodyFailed("map too large".into()));
            }
            let mut entries = Vec::with_capacity(size.min(1024));
            for _ in 0..size {
                let k = decode_value(proto, buf, kt)?;
                let v = decode_value(proto, buf, vt)?;
                entries.push((k, v));
            }
            proto.read_map_end(buf)?;
            Value::Map(kt, vt, entries)
        },
        TType::List => {
            let (et, size) = proto.read_list_begin(buf)?;
            if size > MAX_CONTAINER_SIZE {
                return Err(RpcError::DecodeBodyFailed("list too large".into()));
            }
            let mut items = Vec::with_capacity(size.min(1024));
            for _ in 0..size {
                items.push(decode_value(proto, buf, et)?);
            }
            proto.read_list_end(buf)?;
            Value::List(et, items)
        },
        TType::Set => {
            let (et, size) = proto.read_set_begin(buf)?;
            if size > MAX_CONTAINER_SIZE {
                return Err(RpcError::DecodeBodyFailed("set too large".into()));
            }
            let mut items = Vec::with_capacity(size.min(1024));
            for _ in 0..size {
                items.push(decode_value(proto, buf, et)?);
            }
            proto.read_set_end(buf)?;
            Value::Set(et, items)
        },
    })
}

/// Which of the three installed formats a connection negotiated.
/// Mixing formats within one message is forbidden (spec.md §4.2); the
/// choice is fixed per-connection at `Attach` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Binary,
    Json,
    Bson,
}

impl CodecKind {
    pub fn protocol(self) -> Box<dyn Protocol> {
        match self {
            CodecKind::Binary => Box::new(binary::BinaryCodec),
            CodecKind::Json => Box::new(json::JsonCodec::default()),
            CodecKind::Bson => Box::new(bson::BsonCodec::default()),
        }
    }
}
