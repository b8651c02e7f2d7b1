// SPDX-License-Identifier: Apache-2.0

//! BSON format, ported from
//! `examples/original_source/src/framework/dr/protocol/bson_protocol.h`/`.cpp`.
//!
//! A message is one outer BSON document: a 14-byte header (session id
//! as a BSON int64 field, name as a BSON string field), followed by a
//! nested document holding the struct body. Every document/binary is
//! a `(length_i32_le, content, trailing_byte)` blob whose length is
//! only known once its content has been fully written, so the C++
//! original keeps a stack of bookmark positions it backpatches in
//! place. [`MemoryBuffer`] has no such in-place patch, so each nesting
//! level is instead built in its own scratch buffer and only appended
//! to its parent (or flushed to `buf`) once its length is known.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer::MemoryBuffer;
use crate::codec::{MAX_CONTAINER_SIZE, MAX_STRING_LEN, MessageType, Protocol, TType};
use crate::error::RpcError;

const BSON_DOUBLE: u8 = 0x01;
const BSON_STRING: u8 = 0x02;
const BSON_DOCUMENT: u8 = 0x03;
const BSON_BINARY: u8 = 0x05;
const BSON_BOOL: u8 = 0x08;
const BSON_STOP: u8 = 0x0A;
const BSON_INT32: u8 = 0x10;
const BSON_INT64: u8 = 0x12;
const BSON_BINARY_USER_SUBTYPE: u8 = 0x80;
const BSON_THRIFT_VERSION: i8 = 1;
const MAX_BSON_LEN: usize = 16 * 1024 * 1024;

fn bson_type_for(ttype: TType) -> u8 {
    match ttype {
        TType::Stop => BSON_STOP,
        TType::Bool => BSON_BOOL,
        TType::Byte | TType::I16 | TType::I32 => BSON_INT32,
        TType::I64 => BSON_INT64,
        TType::Double => BSON_DOUBLE,
        TType::String => BSON_STRING,
        TType::Struct => BSON_DOCUMENT,
        TType::Map | TType::Set | TType::List => BSON_BINARY,
    }
}

/// A nesting level currently being written. Content accumulates in
/// `scratch`; the length prefix is only known at `_end` time.
enum WriteCtx {
    Document(BytesMut),
    Binary(BytesMut),
}

/// A nesting level currently being read: how many content bytes
/// remain before this level's own terminator/bookkeeping is due.
enum ReadCtx {
    Document(i64),
    Binary(i64),
}

#[derive(Debug, Default)]
pub struct BsonCodec {
    write_stack: Vec<WriteCtx>,
    read_stack: Vec<ReadCtx>,
}

impl BsonCodec {
    /// Route freshly produced bytes to the current nesting level, or
    /// straight to `buf` if we're not inside a document/binary.
    fn emit(&mut self, buf: &mut MemoryBuffer, bytes: &[u8]) -> Result<(), RpcError> {
        match self.write_stack.last_mut() {
            Some(WriteCtx::Document(scratch)) | Some(WriteCtx::Binary(scratch)) => {
                scratch.extend_from_slice(bytes);
                Ok(())
            },
            None => buf.write(bytes),
        }
    }

    fn push_document(&mut self) {
        self.write_stack.push(WriteCtx::Document(BytesMut::new()));
    }

    fn push_binary(&mut self) {
        self.write_stack.push(WriteCtx::Binary(BytesMut::new()));
    }

    /// Pop the current document, compute its length-prefixed blob, and
    /// hand it to whatever nesting level (or `buf`) comes next.
    fn finish_document(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        let scratch = match self.write_stack.pop() {
            Some(WriteCtx::Document(scratch)) => scratch,
            _ => return Err(RpcError::ProtocolException("document_end without document_begin".into())),
        };
        if scratch.len() + 5 > MAX_BSON_LEN {
            return Err(RpcError::EncodeBodyFailed("bson document exceeds 16MiB cap".into()));
        }
        let total_len = (scratch.len() + 5) as i32;
        let mut blob = BytesMut::with_capacity(scratch.len() + 5);
        blob.put_i32_le(total_len);
        blob.extend_from_slice(&scratch);
        blob.put_u8(0);
        self.emit(buf, &blob)
    }

    fn finish_binary(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        let scratch = match self.write_stack.pop() {
            Some(WriteCtx::Binary(scratch)) => scratch,
            _ => return Err(RpcError::ProtocolException("binary_end without binary_begin".into())),
        };
        if scratch.len() + 5 > MAX_BSON_LEN {
            return Err(RpcError::EncodeBodyFailed("bson binary exceeds 16MiB cap".into()));
        }
        let mut blob = BytesMut::with_capacity(scratch.len() + 5);
        blob.put_i32_le(scratch.len() as i32);
        blob.put_u8(BSON_BINARY_USER_SUBTYPE);
        blob.extend_from_slice(&scratch);
        self.emit(buf, &blob)
    }

    /// Read `n` bytes, charging them against the innermost open
    /// document/binary's remaining budget (a no-op at the outermost
    /// level, where nothing is tracked yet).
    fn take(&mut self, buf: &mut MemoryBuffer, n: usize) -> Result<Bytes, RpcError> {
        let bytes = buf.read_exact(n)?;
        if let Some(ReadCtx::Document(remaining) | ReadCtx::Binary(remaining)) = self.read_stack.last_mut() {
            *remaining -= n as i64;
            if *remaining < 0 {
                return Err(RpcError::DecodeBodyFailed(
                    "bson document/binary overran its declared length".into(),
                ));
            }
        }
        Ok(bytes)
    }

    fn push_new_document(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        let total_len = (&self.take(buf, 4)?[..]).get_i32_le();
        if total_len < 0 || total_len as usize > MAX_BSON_LEN {
            return Err(RpcError::DecodeBodyFailed(format!("bson document length {total_len} out of range")));
        }
        let remaining = total_len as i64 - 4 - 1;
        if remaining < 0 {
            return Err(RpcError::DecodeBodyFailed("bson document too short for its own header".into()));
        }
        self.read_stack.push(ReadCtx::Document(remaining));
        Ok(())
    }

    fn finish_document_read(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        match self.read_stack.pop() {
            Some(ReadCtx::Document(remaining)) => {
                if remaining != 0 {
                    return Err(RpcError::DecodeBodyFailed("bson document had unread trailing bytes".into()));
                }
            },
            _ => return Err(RpcError::ProtocolException("document_end without document_begin".into())),
        }
        self.take(buf, 1)?;
        Ok(())
    }

    fn push_new_binary(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        let head = self.take(buf, 5)?;
        let bin_len = (&head[0..4]).get_i32_le();
        if head[4] != BSON_BINARY_USER_SUBTYPE {
            return Err(RpcError::DecodeBodyFailed("bson binary has an unexpected subtype".into()));
        }
        if bin_len < 0 || bin_len as usize > MAX_BSON_LEN {
            return Err(RpcError::DecodeBodyFailed(format!("bson binary length {bin_len} out of range")));
        }
        self.read_stack.push(ReadCtx::Binary(bin_len as i64));
        Ok(())
    }

    fn finish_binary_read(&mut self) -> Result<(), RpcError> {
        match self.read_stack.pop() {
            Some(ReadCtx::Binary(remaining)) => {
                if remaining != 0 {
                    return Err(RpcError::DecodeBodyFailed("bson binary had unread trailing bytes".into()));
                }
                Ok(())
            },
            _ => Err(RpcError::ProtocolException("binary_end without binary_begin".into())),
        }
    }
}

impl Protocol for BsonCodec {
    fn write_message_begin(
        &mut self,
        buf: &mut MemoryBuffer,
        name: &str,
        mtype: MessageType,
        session_id: u64,
    ) -> Result<(), RpcError> {
        if name.len() > MAX_STRING_LEN {
            return Err(RpcError::EncodeBodyFailed("message name exceeds 8MiB cap".into()));
        }
        self.push_document();
        let mut header = [0u8; 14];
        header[0] = BSON_INT64;
        header[1] = mtype as i8 as u8;
        header[2] = 0;
        header[3..11].copy_from_slice(&(session_id as i64).to_le_bytes());
        header[11] = BSON_STRING;
        header[12] = BSON_THRIFT_VERSION as u8;
        header[13] = 0;
        self.emit(buf, &header)?;
        self.emit(buf, &((name.len() + 1) as i32).to_le_bytes())?;
        self.emit(buf, name.as_bytes())?;
        self.emit(buf, &[0])?;
        // marks the start of the nested body document; mirrored by the
        // two bytes `read_message_begin` discards after the name.
        self.emit(buf, &[BSON_DOCUMENT, 0])
    }

    fn write_message_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.finish_document(buf)
    }

    fn write_struct_begin(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.push_document();
        Ok(())
    }

    fn write_struct_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.finish_document(buf)
    }

    fn write_field_begin(&mut self, buf: &mut MemoryBuffer, ttype: TType, id: i16) -> Result<(), RpcError> {
        let fid = id as u16;
        let b0 = (((fid >> 11) & 0x1F) as u8) | 0x40;
        let b1 = (((fid >> 6) & 0x1F) as u8) | 0x40;
        let b2 = ((fid & 0x3F) as u8) | 0x40;
        let bytes = [bson_type_for(ttype), ttype as u8, b0, b1, b2, 0];
        self.emit(buf, &bytes)
    }

    fn write_field_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn write_field_stop(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.emit(buf, &[BSON_STOP, 0])
    }

    fn write_map_begin(&mut self, buf: &mut MemoryBuffer, key: TType, val: TType, size: usize) -> Result<(), RpcError> {
        if size > MAX_CONTAINER_SIZE {
            return Err(RpcError::EncodeBodyFailed("map too large for bson".into()));
        }
        self.push_binary();
        let header = [BSON_INT32, key as u8, val as u8, 0];
        self.emit(buf, &header)?;
        self.emit(buf, &(size as u32).to_le_bytes())
    }

    fn write_map_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.finish_binary(buf)
    }

    fn write_list_begin(&mut self, buf: &mut MemoryBuffer, elem: TType, size: usize) -> Result<(), RpcError> {
        if size > MAX_CONTAINER_SIZE {
            return Err(RpcError::EncodeBodyFailed("list too large for bson".into()));
        }
        self.push_binary();
        let header = [BSON_INT32, elem as u8, 0];
        self.emit(buf, &header)?;
        self.emit(buf, &(size as u32).to_le_bytes())
    }

    fn write_list_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.finish_binary(buf)
    }

    fn write_set_begin(&mut self, buf: &mut MemoryBuffer, elem: TType, size: usize) -> Result<(), RpcError> {
        self.write_list_begin(buf, elem, size)
    }

    fn write_set_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.write_list_end(buf)
    }

    fn write_bool(&mut self, buf: &mut MemoryBuffer, v: bool) -> Result<(), RpcError> {
        self.emit(buf, &[v as u8])
    }

    fn write_byte(&mut self, buf: &mut MemoryBuffer, v: i8) -> Result<(), RpcError> {
        self.emit(buf, &(v as i32).to_le_bytes())
    }

    fn write_i16(&mut self, buf: &mut MemoryBuffer, v: i16) -> Result<(), RpcError> {
        self.emit(buf, &(v as i32).to_le_bytes())
    }

    fn write_i32(&mut self, buf: &mut MemoryBuffer, v: i32) -> Result<(), RpcError> {
        self.emit(buf, &v.to_le_bytes())
    }

    fn write_i64(&mut self, buf: &mut MemoryBuffer, v: i64) -> Result<(), RpcError> {
        self.emit(buf, &v.to_le_bytes())
    }

    fn write_double(&mut self, buf: &mut MemoryBuffer, v: f64) -> Result<(), RpcError> {
        self.emit(buf, &v.to_bits().to_le_bytes())
    }

    fn write_string(&mut self, buf: &mut MemoryBuffer, v: &str) -> Result<(), RpcError> {
        if v.len() > MAX_STRING_LEN {
            return Err(RpcError::EncodeBodyFailed("string exceeds 8MiB cap".into()));
        }
        self.emit(buf, &((v.len() + 1) as i32).to_le_bytes())?;
        self.emit(buf, v.as_bytes())?;
        self.emit(buf, &[0])
    }

    fn write_binary(&mut self, buf: &mut MemoryBuffer, v: &[u8]) -> Result<(), RpcError> {
        if v.len() > MAX_STRING_LEN {
            return Err(RpcError::EncodeBodyFailed("binary exceeds 8MiB cap".into()));
        }
        self.emit(buf, &((v.len() + 1) as i32).to_le_bytes())?;
        self.emit(buf, v)?;
        self.emit(buf, &[0])
    }

    fn read_message_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(String, MessageType, u64), RpcError> {
        self.read_stack.clear();
        self.push_new_document(buf)?;
        let header = self.take(buf, 14)?;
        if header[0] != BSON_INT64 || header[2] != 0 || header[11] != BSON_STRING || header[13] != 0 {
            return Err(RpcError::DecodeHeadFailed("malformed bson message header".into()));
        }
        let mtype = MessageType::try_from(header[1] as i8)?;
        let session_id = (&header[3..11]).get_i64_le() as u64;
        if header[12] != BSON_THRIFT_VERSION as u8 {
            return Err(RpcError::DecodeHeadFailed(format!("unsupported bson thrift version {}", header[12])));
        }
        let name_len = (&self.take(buf, 4)?[..]).get_i32_le();
        if name_len < 1 || name_len as usize > MAX_STRING_LEN + 1 {
            return Err(RpcError::DecodeHeadFailed(format!("message name length {name_len} out of range")));
        }
        let name_bytes = self.take(buf, name_len as usize)?;
        let name = String::from_utf8(name_bytes[..name_bytes.len() - 1].to_vec())
            .map_err(|e| RpcError::DecodeHeadFailed(e.to_string()))?;
        // struct-begin marker for the nested body document, consumed and
        // discarded just like the C++ original.
        self.take(buf, 2)?;
        Ok((name, mtype, session_id))
    }

    fn read_message_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.finish_document_read(buf)
    }

    fn read_struct_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.push_new_document(buf)
    }

    fn read_struct_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.finish_document_read(buf)
    }

    fn read_field_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(TType, i16), RpcError> {
        let head = self.take(buf, 2)?;
        let ttype_raw = head[1];
        if ttype_raw == TType::Stop as u8 {
            return Ok((TType::Stop, 0));
        }
        let ttype = TType::from_u8(ttype_raw)?;
        if head[0] != bson_type_for(ttype) {
            return Err(RpcError::DecodeBodyFailed("bson field tag does not match its declared type".into()));
        }
        let idbytes = self.take(buf, 4)?;
        let id = (((idbytes[0] & 0x1F) as u16) << 11)
            | (((idbytes[1] & 0x1F) as u16) << 6)
            | ((idbytes[2] & 0x3F) as u16);
        Ok((ttype, id as i16))
    }

    fn read_field_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn read_map_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(TType, TType, usize), RpcError> {
        self.push_new_binary(buf)?;
        let header = self.take(buf, 8)?;
        if header[0] != BSON_INT32 {
            return Err(RpcError::DecodeBodyFailed("malformed bson map header".into()));
        }
        let key = TType::from_u8(header[1])?;
        let val = TType::from_u8(header[2])?;
        let size = (&header[4..8]).get_u32_le() as usize;
        if size > MAX_CONTAINER_SIZE {
            return Err(RpcError::DecodeBodyFailed("map too large".into()));
        }
        Ok((key, val, size))
    }

    fn read_map_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.finish_binary_read()
    }

    fn read_list_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(TType, usize), RpcError> {
        self.push_new_binary(buf)?;
        let header = self.take(buf, 7)?;
        if header[0] != BSON_INT32 {
            return Err(RpcError::DecodeBodyFailed("malformed bson list header".into()));
        }
        let elem = TType::from_u8(header[1])?;
        let size = (&header[3..7]).get_u32_le() as usize;
        if size > MAX_CONTAINER_SIZE {
            return Err(RpcError::DecodeBodyFailed("list too large".into()));
        }
        Ok((elem, size))
    }

    fn read_list_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.finish_binary_read()
    }

    fn read_set_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(TType, usize), RpcError> {
        self.read_list_begin(buf)
    }

    fn read_set_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.read_list_end(buf)
    }

    fn read_bool(&mut self, buf: &mut MemoryBuffer) -> Result<bool, RpcError> {
        Ok(self.take(buf, 1)?[0] != 0)
    }

    fn read_byte(&mut self, buf: &mut MemoryBuffer) -> Result<i8, RpcError> {
        Ok((&self.take(buf, 4)?[..]).get_i32_le() as i8)
    }

    fn read_i16(&mut self, buf: &mut MemoryBuffer) -> Result<i16, RpcError> {
        Ok((&self.take(buf, 4)?[..]).get_i32_le() as i16)
    }

    fn read_i32(&mut self, buf: &mut MemoryBuffer) -> Result<i32, RpcError> {
        Ok((&self.take(buf, 4)?[..]).get_i32_le())
    }

    fn read_i64(&mut self, buf: &mut MemoryBuffer) -> Result<i64, RpcError> {
        Ok((&self.take(buf, 8)?[..]).get_i64_le())
    }

    fn read_double(&mut self, buf: &mut MemoryBuffer) -> Result<f64, RpcError> {
        Ok(f64::from_bits((&self.take(buf, 8)?[..]).get_u64_le()))
    }

    fn read_string(&mut self, buf: &mut MemoryBuffer) -> Result<String, RpcError> {
        let len = (&self.take(buf, 4)?[..]).get_i32_le();
        if len < 1 || len as usize > MAX_STRING_LEN + 1 {
            return Err(RpcError::DecodeBodyFailed(format!("string length {len} out of range")));
        }
        let bytes = self.take(buf, len as usize)?;
        String::from_utf8(bytes[..bytes.len() - 1].to_vec()).map_err(|e| RpcError::DecodeBodyFailed(e.to_string()))
    }

    fn read_binary(&mut self, buf: &mut MemoryBuffer) -> Result<Bytes, RpcError> {
        let len = (&self.take(buf, 4)?[..]).get_i32_le();
        if len < 1 || len as usize > MAX_STRING_LEN + 1 {
            return Err(RpcError::DecodeBodyFailed(format!("binary length {len} out of range")));
        }
        let bytes = self.take(buf, len as usize)?;
        Ok(bytes.slice(..bytes.len() - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Field, Value, decode_value, encode_value};

    fn sample_struct() -> Value {
        Value::Struct(vec![
            Field {
                id: 1,
                value: Value::Str("tom".into()),
            },
            Field {
                id: 2,
                value: Value::I32(20),
            },
            Field {
                id: 3,
                value: Value::List(TType::I32, vec![Value::I32(1), Value::I32(2), Value::I32(3)]),
            },
            Field {
                id: 4,
                value: Value::Map(
                    TType::String,
                    TType::I32,
                    vec![(Value::Str("a".into()), Value::I32(1))],
                ),
            },
        ])
    }

    fn round_trip_message(value: &Value) -> Value {
        let mut codec = BsonCodec::default();
        let mut out = MemoryBuffer::owned(64);
        codec
            .write_message_begin(&mut out, "HelloWorld:hello", MessageType::Call, 42)
            .expect("encode head");
        encode_value(&mut codec, &mut out, value).expect("encode body");
        codec.write_message_end(&mut out).expect("encode tail");
        let bytes = out.into_bytes();

        let mut input = MemoryBuffer::observe(bytes);
        let (name, mtype, sid) = codec.read_message_begin(&mut input).expect("decode head");
        assert_eq!(name, "HelloWorld:hello");
        assert_eq!(mtype, MessageType::Call);
        assert_eq!(sid, 42);
        let decoded = decode_value(&mut codec, &mut input, TType::Struct).expect("decode body");
        codec.read_message_end(&mut input).expect("decode tail");
        decoded
    }

    #[test]
    fn round_trips_struct_through_a_full_message() {
        let value = sample_struct();
        assert_eq!(round_trip_message(&value), value);
    }

    #[test]
    fn empty_struct_round_trips() {
        let value = Value::Struct(vec![]);
        assert_eq!(round_trip_message(&value), value);
    }

    #[test]
    fn oversized_string_is_rejected_on_encode() {
        let mut codec = BsonCodec::default();
        let mut out = MemoryBuffer::owned(4);
        let huge = "x".repeat(MAX_STRING_LEN + 1);
        assert!(codec.write_string(&mut out, &huge).is_err());
    }

    #[test]
    fn field_id_bit_packing_round_trips_negative_and_large_ids() {
        for id in [0i16, 1, -1, i16::MAX, i16::MIN, 12345] {
            let mut codec = BsonCodec::default();
            let mut out = MemoryBuffer::owned(16);
            codec.write_field_begin(&mut out, TType::I32, id).expect("field begin");
            let mut input = MemoryBuffer::observe(out.into_bytes());
            let (ttype, got) = codec.read_field_begin(&mut input).expect("field begin decode");
            assert_eq!(ttype, TType::I32);
            assert_eq!(got, id);
        }
    }
}
