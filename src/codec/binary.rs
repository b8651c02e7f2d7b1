// SPDX-License-Identifier: Apache-2.0

//! Default binary format, ported from
//! `examples/original_source/src/framework/dr/protocol/binary_protocol.h`.
//!
//! Every scalar is big-endian fixed width. `message_begin` writes a
//! 32-bit version-tagged header (high 16 bits `0x8001`, low 16 bits the
//! message type), then a length-prefixed name, then a 64-bit session
//! id. Struct bodies are `(type_byte, field_id_i16, value)` tuples
//! terminated by a zero type byte. Container begins are
//! `(element_type_byte, size_i32)` (maps write two type bytes).
//! Strings/binaries are `(length_i32, bytes)`.

use bytes::{Buf, Bytes};

use crate::buffer::MemoryBuffer;
use crate::codec::{MAX_CONTAINER_SIZE, MAX_STRING_LEN, MessageType, Protocol, TType};
use crate::error::RpcError;

const VERSION_1: i32 = 0x8001_0000u32 as i32;
const VERSION_MASK: i32 = 0xffff_0000u32 as i32;

#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

fn write_len_prefixed(buf: &mut MemoryBuffer, bytes: &[u8]) -> Result<(), RpcError> {
    if bytes.len() > MAX_STRING_LEN {
        return Err(RpcError::EncodeBodyFailed("string exceeds 8MiB cap".into()));
    }
    buf.write(&(bytes.len() as i32).to_be_bytes())?;
    buf.write(bytes)
}

fn read_len_prefixed(buf: &mut MemoryBuffer) -> Result<Bytes, RpcError> {
    let len = read_i32_raw(buf)?;
    if len < 0 || len as usize > MAX_STRING_LEN {
        return Err(RpcError::DecodeBodyFailed(format!(
            "string/binary length {len} out of range"
        )));
    }
    buf.read_exact(len as usize)
}

fn read_i32_raw(buf: &mut MemoryBuffer) -> Result<i32, RpcError> {
    Ok((&buf.read_exact(4)?[..]).get_i32())
}

impl Protocol for BinaryCodec {
    fn write_message_begin(
        &mut self,
        buf: &mut MemoryBuffer,
        name: &str,
        mtype: MessageType,
        session_id: u64,
    ) -> Result<(), RpcError> {
        let header = VERSION_1 | (mtype as i32 & !VERSION_MASK);
        buf.write(&header.to_be_bytes())?;
        write_len_prefixed(buf, name.as_bytes())?;
        buf.write(&(session_id as i64).to_be_bytes())
    }

    fn write_message_end(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn write_struct_begin(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn write_struct_end(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn write_field_begin(
        &mut self,
        buf: &mut MemoryBuffer,
        ttype: TType,
        id: i16,
    ) -> Result<(), RpcError> {
        buf.write(&[ttype as u8])?;
        buf.write(&id.to_be_bytes())
    }

    fn write_field_end(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn write_field_stop(
        &mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        buf.write(&[TType::Stop as u8])
    }

    fn write_map_begin(
        &mut self,
        buf: &mut MemoryBuffer,
        key: TType,
        val: TType,
        size: usize,
    ) -> Result<(), RpcError> {
        buf.write(&[key as u8, val as u8])?;
        buf.write(&(size as i32).to_be_bytes())
    }

    fn write_map_end(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn write_list_begin(
        &mut self,
        buf: &mut MemoryBuffer,
        elem: TType,
        size: usize,
    ) -> Result<(), RpcError> {
        buf.write(&[elem as u8])?;
        buf.write(&(size as i32).to_be_bytes())
    }

    fn write_list_end(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn write_set_begin(
        &mut self,
        buf: &mut MemoryBuffer,
        elem: TType,
        size: usize,
    ) -> Result<(), RpcError> {
        self.write_list_begin(buf, elem, size)
    }

    fn write_set_end(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn write_bool(
        &mut self, buf: &mut MemoryBuffer, v: bool) -> Result<(), RpcError> {
        buf.write(&[v as u8])
    }

    fn write_byte(
        &mut self, buf: &mut MemoryBuffer, v: i8) -> Result<(), RpcError> {
        buf.write(&v.to_be_bytes())
    }

    fn write_i16(
        &mut self, buf: &mut MemoryBuffer, v: i16) -> Result<(), RpcError> {
        buf.write(&v.to_be_bytes())
    }

    fn write_i32(
        &mut self, buf: &mut MemoryBuffer, v: i32) -> Result<(), RpcError> {
        buf.write(&v.to_be_bytes())
    }

    fn write_i64(
        &mut self, buf: &mut MemoryBuffer, v: i64) -> Result<(), RpcError> {
        buf.write(&v.to_be_bytes())
    }

    fn write_double(
        &mut self, buf: &mut MemoryBuffer, v: f64) -> Result<(), RpcError> {
        buf.write(&v.to_bits().to_be_bytes())
    }

    fn write_string(
        &mut self, buf: &mut MemoryBuffer, v: &str) -> Result<(), RpcError> {
        write_len_prefixed(buf, v.as_bytes())
    }

    fn write_binary(
        &mut self, buf: &mut MemoryBuffer, v: &[u8]) -> Result<(), RpcError> {
        write_len_prefixed(buf, v)
    }

    fn read_message_begin(
        &mut self,
        buf: &mut MemoryBuffer,
    ) -> Result<(String, MessageType, u64), RpcError> {
        let header = read_i32_raw(buf)?;
        if header & VERSION_MASK != VERSION_1 {
            return Err(RpcError::DecodeHeadFailed(format!(
                "bad binary version tag: {header:#x}"
            )));
        }
        let mtype = MessageType::try_from((header & 0xff) as i8)?;
        let name = String::from_utf8(read_len_prefixed(buf)?.to_vec())
            .map_err(|e| RpcError::DecodeHeadFailed(e.to_string()))?;
        let session_id = (&buf.read_exact(8)?[..]).get_i64() as u64;
        Ok((name, mtype, session_id))
    }

    fn read_message_end(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn read_struct_begin(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn read_struct_end(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn read_field_begin(
        &mut self, buf: &mut MemoryBuffer) -> Result<(TType, i16), RpcError> {
        let ttype = TType::from_u8(buf.read_exact(1)?[0])?;
        if ttype == TType::Stop {
            return Ok((TType::Stop, 0));
        }
        let id = (&buf.read_exact(2)?[..]).get_i16();
        Ok((ttype, id))
    }

    fn read_field_end(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn read_map_begin(
        &mut self, buf: &mut MemoryBuffer) -> Result<(TType, TType, usize), RpcError> {
        let kv = buf.read_exact(2)?;
        let key = TType::from_u8(kv[0])?;
        let val = TType::from_u8(kv[1])?;
        let size = read_i32_raw(buf)?;
        check_container_size(size)?;
        Ok((key, val, size as usize))
    }

    fn read_map_end(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn read_list_begin(
        &mut self, buf: &mut MemoryBuffer) -> Result<(TType, usize), RpcError> {
        let elem = TType::from_u8(buf.read_exact(1)?[0])?;
        let size = read_i32_raw(buf)?;
        check_container_size(size)?;
        Ok((elem, size as usize))
    }

    fn read_list_end(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn read_set_begin(
        &mut self, buf: &mut MemoryBuffer) -> Result<(TType, usize), RpcError> {
        self.read_list_begin(buf)
    }

    fn read_set_end(
        &mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn read_bool(
        &mut self, buf: &mut MemoryBuffer) -> Result<bool, RpcError> {
        Ok(buf.read_exact(1)?[0] != 0)
    }

    fn read_byte(
        &mut self, buf: &mut MemoryBuffer) -> Result<i8, RpcError> {
        Ok(buf.read_exact(1)?[0] as i8)
    }

    fn read_i16(
        &mut self, buf: &mut MemoryBuffer) -> Result<i16, RpcError> {
        Ok((&buf.read_exact(2)?[..]).get_i16())
    }

    fn read_i32(
        &mut self, buf: &mut MemoryBuffer) -> Result<i32, RpcError> {
        read_i32_raw(buf)
    }

    fn read_i64(
        &mut self, buf: &mut MemoryBuffer) -> Result<i64, RpcError> {
        Ok((&buf.read_exact(8)?[..]).get_i64())
    }

    fn read_double(
        &mut self, buf: &mut MemoryBuffer) -> Result<f64, RpcError> {
        let bits = (&buf.read_exact(8)?[..]).get_u64();
        Ok(f64::from_bits(bits))
    }

    fn read_string(
        &mut self, buf: &mut MemoryBuffer) -> Result<String, RpcError> {
        String::from_utf8(read_len_prefixed(buf)?.to_vec())
            .map_err(|e| RpcError::DecodeBodyFailed(e.to_string()))
    }

    fn read_binary(
        &mut self, buf: &mut MemoryBuffer) -> Result<Bytes, RpcError> {
        read_len_prefixed(buf)
    }
}

fn check_container_size(size: i32) -> Result<(), RpcError> {
    if size < 0 || size as usize > MAX_CONTAINER_SIZE {
        return Err(RpcError::DecodeBodyFailed(format!(
            "container size {size} out of range"
        )));
    }
    Ok(())
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
                value: Value::List(
                    TType::I32,
                    vec![Value::I32(1), Value::I32(2), Value::I32(3)],
                ),
            },
        ])
    }

    #[test]
    fn round_trips_struct() {
        let mut codec = BinaryCodec;
        let mut out = MemoryBuffer::owned(64);
        let value = sample_struct();
        encode_value(&mut codec, &mut out, &value).expect("encode");
        let bytes = out.into_bytes();

        let mut input = MemoryBuffer::observe(bytes);
        let decoded = decode_value(&mut codec, &mut input, TType::Struct).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn message_head_round_trips() {
        let mut codec = BinaryCodec;
        let mut out = MemoryBuffer::owned(64);
        codec
            .write_message_begin(&mut out, "HelloWorld:hello", MessageType::Call, 42)
            .expect("encode head");
        let bytes = out.into_bytes();
        let mut input = MemoryBuffer::observe(bytes);
        let (name, mtype, sid) = codec.read_message_begin(&mut input).expect("decode head");
        assert_eq!(name, "HelloWorld:hello");
        assert_eq!(mtype, MessageType::Call);
        assert_eq!(sid, 42);
    }

    #[test]
    fn oversized_string_is_rejected_on_encode() {
        let mut codec = BinaryCodec;
        let mut out = MemoryBuffer::owned(4);
        let huge = "x".repeat(MAX_STRING_LEN + 1);
        assert!(codec.write_string(&mut out, &huge).is_err());
    }
}
