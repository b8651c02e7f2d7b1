// SPDX-License-Identifier: Apache-2.0

//! JSON wire format, ported from
//! `examples/original_source/src/framework/dr/protocol/rapidjson_protocol.cpp`.
//!
//! The original streams a message as a top-level JSON array
//! `[version, name, message_type, session_id, body]` (`kThriftVersion1
//! == 1`), relying on its generated structs' reflection metadata to
//! know each field's wire type on the way back in. This crate has no
//! IDL compiler (module docs in `codec/mod.rs`), so there is no schema
//! to consult at decode time. Struct fields here are therefore encoded
//! as `"<field id>": [type_tag, value]` pairs instead of a bare value —
//! the one deliberate departure from that wire shape, recorded in
//! DESIGN.md. Containers stay self-describing the same way: `list`/
//! `set` are JSON arrays, and `map` collapses to a native object when
//! the key type is `T_STRING`, else two parallel key/value arrays,
//! both wrapped with their declared element/key/value types since
//! `map_begin`/`list_begin` already require the caller to declare them.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Map as JsonMap, Value as Json, json};

use crate::buffer::MemoryBuffer;
use crate::codec::{MessageType, Protocol, TType};
use crate::error::RpcError;

const THRIFT_VERSION_1: i64 = 1;

enum WriteFrame {
    Struct {
        fields: Vec<(i16, u8, Json)>,
        pending_id: Option<i16>,
    },
    Map {
        key_ty: TType,
        val_ty: TType,
        pairs: Vec<(Json, Json)>,
        pending_key: Option<Json>,
    },
    List {
        elem_ty: TType,
        items: Vec<Json>,
    },
}

enum ReadFrame {
    Struct {
        remaining: Vec<(i16, TType, Json)>,
    },
    Map {
        kt: TType,
        vt: TType,
        pairs: Vec<(Json, Json)>,
        pos: usize,
    },
    List {
        items: Vec<Json>,
        pos: usize,
    },
}

/// Builds/consumes one JSON message at a time. Stateful by necessity
/// (see module docs): `write_stack`/`read_stack` track the container
/// currently being assembled or walked.
#[derive(Default)]
pub struct JsonCodec {
    write_stack: Vec<WriteFrame>,
    pending_write_body: Option<Json>,
    msg_header: Option<(String, MessageType, u64)>,

    staged: Option<Json>,
    read_stack: Vec<ReadFrame>,
    pending_read_body: Option<Json>,
}

impl JsonCodec {
    fn attach(&mut self, value: Json) -> Result<(), RpcError> {
        match self.write_stack.last_mut() {
            None => {
                self.pending_write_body = Some(value);
                Ok(())
            },
            Some(WriteFrame::Struct { fields, pending_id }) => {
                let id = pending_id
                    .take()
                    .ok_or_else(|| RpcError::ProtocolException("field value without a field_begin".into()))?;
                fields.push((id, 0, value));
                Ok(())
            },
            Some(WriteFrame::Map {
                pairs, pending_key, ..
            }) => {
                match pending_key.take() {
                    Some(key) => pairs.push((key, value)),
                    None => *pending_key = Some(value),
                }
                Ok(())
            },
            Some(WriteFrame::List { items, .. }) => {
                items.push(value);
                Ok(())
            },
        }
    }

    /// Like [`Self::attach`], but also stamps the declared `ttype` into
    /// the innermost struct field wrapper (only struct fields need a
    /// type tag; map/list elements already know their type from
    /// `map_begin`/`list_begin`).
    fn attach_typed(&mut self, ttype: TType, value: Json) -> Result<(), RpcError> {
        if let Some(WriteFrame::Struct { fields, pending_id }) = self.write_stack.last_mut() {
            let id = pending_id
                .take()
                .ok_or_else(|| RpcError::ProtocolException("field value without a field_begin".into()))?;
            fields.push((id, ttype as u8, value));
            return Ok(());
        }
        self.attach(value)
    }

    fn take_pending(&mut self) -> Result<Json, RpcError> {
        if let Some(v) = self.staged.take() {
            return Ok(v);
        }
        match self.read_stack.last_mut() {
            Some(ReadFrame::Map { pairs, pos, .. }) => {
                let idx = *pos / 2;
                let is_key = *pos % 2 == 0;
                let pair = pairs
                    .get(idx)
                    .ok_or_else(|| RpcError::DecodeBodyFailed("map exhausted".into()))?;
                let v = if is_key { pair.0.clone() } else { pair.1.clone() };
                *pos += 1;
                Ok(v)
            },
            Some(ReadFrame::List { items, pos }) => {
                let v = items
                    .get(*pos)
                    .cloned()
                    .ok_or_else(|| RpcError::DecodeBodyFailed("list exhausted".into()))?;
                *pos += 1;
                Ok(v)
            },
            Some(ReadFrame::Struct { .. }) => {
                Err(RpcError::ProtocolException("expected read_field_begin before a value".into()))
            },
            None => self
                .pending_read_body
                .take()
                .ok_or_else(|| RpcError::DecodeBodyFailed("no pending JSON value".into())),
        }
    }
}

fn as_i64(v: &Json) -> Result<i64, RpcError> {
    v.as_i64()
        .ok_or_else(|| RpcError::DecodeBodyFailed(format!("expected integer, got {v}")))
}

impl Protocol for JsonCodec {
    fn write_message_begin(
        &mut self,
        _buf: &mut MemoryBuffer,
        name: &str,
        mtype: MessageType,
        session_id: u64,
    ) -> Result<(), RpcError> {
        // Nothing hits the wire until write_message_end: the full
        // array (including the body built by the caller's
        // encode_value in between) is serialized in one shot.
        self.msg_header = Some((name.to_owned(), mtype, session_id));
        Ok(())
    }

    fn write_message_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        let (name, mtype, session_id) = self
            .msg_header
            .take()
            .ok_or_else(|| RpcError::ProtocolException("message_end without message_begin".into()))?;
        let body = self
            .pending_write_body
            .take()
            .ok_or_else(|| RpcError::ProtocolException("message_end before a body was encoded".into()))?;
        let root = json!([THRIFT_VERSION_1, name, mtype as i8, session_id, body]);
        let text = serde_json::to_vec(&root).map_err(|e| RpcError::EncodeBodyFailed(e.to_string()))?;
        buf.write(&text)
    }

    fn write_struct_begin(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.write_stack.push(WriteFrame::Struct {
            fields: Vec::new(),
            pending_id: None,
        });
        Ok(())
    }

    fn write_struct_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        let frame = self
            .write_stack
            .pop()
            .ok_or_else(|| RpcError::ProtocolException("struct_end without struct_begin".into()))?;
        let WriteFrame::Struct { fields, .. } = frame else {
            return Err(RpcError::ProtocolException("mismatched struct_end".into()));
        };
        let mut obj = JsonMap::with_capacity(fields.len());
        for (id, ttype, value) in fields {
            obj.insert(id.to_string(), json!([ttype, value]));
        }
        self.attach_typed(TType::Struct, Json::Object(obj))
    }

    fn write_field_begin(&mut self, _buf: &mut MemoryBuffer, _ttype: TType, id: i16) -> Result<(), RpcError> {
        match self.write_stack.last_mut() {
            Some(WriteFrame::Struct { pending_id, .. }) => {
                *pending_id = Some(id);
                Ok(())
            },
            _ => Err(RpcError::ProtocolException("field_begin outside a struct".into())),
        }
    }

    fn write_field_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn write_field_stop(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn write_map_begin(
        &mut self,
        _buf: &mut MemoryBuffer,
        key: TType,
        val: TType,
        _size: usize,
    ) -> Result<(), RpcError> {
        self.write_stack.push(WriteFrame::Map {
            key_ty: key,
            val_ty: val,
            pairs: Vec::new(),
            pending_key: None,
        });
        Ok(())
    }

    fn write_map_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        let frame = self
            .write_stack
            .pop()
            .ok_or_else(|| RpcError::ProtocolException("map_end without map_begin".into()))?;
        let WriteFrame::Map {
            key_ty, val_ty, pairs, ..
        } = frame
        else {
            return Err(RpcError::ProtocolException("mismatched map_end".into()));
        };
        let wrapped = if key_ty == TType::String {
            let mut obj = JsonMap::with_capacity(pairs.len());
            for (k, v) in &pairs {
                let key = k
                    .as_str()
                    .ok_or_else(|| RpcError::EncodeBodyFailed("string-keyed map key was not a JSON string".into()))?;
                obj.insert(key.to_owned(), v.clone());
            }
            json!({"kt": key_ty as u8, "vt": val_ty as u8, "sz": pairs.len(), "obj": obj})
        } else {
            let keys: Vec<Json> = pairs.iter().map(|(k, _)| k.clone()).collect();
            let vals: Vec<Json> = pairs.iter().map(|(_, v)| v.clone()).collect();
            json!({"kt": key_ty as u8, "vt": val_ty as u8, "sz": pairs.len(), "keys": keys, "vals": vals})
        };
        self.attach_typed(TType::Map, wrapped)
    }

    fn write_list_begin(
        &mut self,
        _buf: &mut MemoryBuffer,
        elem: TType,
        _size: usize,
    ) -> Result<(), RpcError> {
        self.write_stack.push(WriteFrame::List {
            elem_ty: elem,
            items: Vec::new(),
        });
        Ok(())
    }

    fn write_list_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.end_list_like(TType::List)
    }

    fn write_set_begin(
        &mut self,
        _buf: &mut MemoryBuffer,
        elem: TType,
        size: usize,
    ) -> Result<(), RpcError> {
        self.write_list_begin(_buf, elem, size)
    }

    fn write_set_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.end_list_like(TType::Set)
    }

    fn write_bool(&mut self, _buf: &mut MemoryBuffer, v: bool) -> Result<(), RpcError> {
        self.attach_typed(TType::Bool, Json::Bool(v))
    }

    fn write_byte(&mut self, _buf: &mut MemoryBuffer, v: i8) -> Result<(), RpcError> {
        self.attach_typed(TType::Byte, json!(v))
    }

    fn write_i16(&mut self, _buf: &mut MemoryBuffer, v: i16) -> Result<(), RpcError> {
        self.attach_typed(TType::I16, json!(v))
    }

    fn write_i32(&mut self, _buf: &mut MemoryBuffer, v: i32) -> Result<(), RpcError> {
        self.attach_typed(TType::I32, json!(v))
    }

    fn write_i64(&mut self, _buf: &mut MemoryBuffer, v: i64) -> Result<(), RpcError> {
        self.attach_typed(TType::I64, json!(v))
    }

    fn write_double(&mut self, _buf: &mut MemoryBuffer, v: f64) -> Result<(), RpcError> {
        self.attach_typed(TType::Double, json!(v))
    }

    fn write_string(&mut self, _buf: &mut MemoryBuffer, v: &str) -> Result<(), RpcError> {
        self.attach_typed(TType::String, Json::String(v.to_owned()))
    }

    fn write_binary(&mut self, _buf: &mut MemoryBuffer, v: &[u8]) -> Result<(), RpcError> {
        self.attach_typed(TType::String, Json::String(BASE64.encode(v)))
    }

    fn read_message_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(String, MessageType, u64), RpcError> {
        let remaining = buf.remaining();
        let bytes = buf.read_exact(remaining)?;
        let root: Json =
            serde_json::from_slice(&bytes).map_err(|e| RpcError::DecodeHeadFailed(e.to_string()))?;
        let arr = root
            .as_array()
            .ok_or_else(|| RpcError::DecodeHeadFailed("expected a JSON array for a message".into()))?;
        if arr.len() < 5 {
            return Err(RpcError::DecodeHeadFailed("message array too short".into()));
        }
        let version = arr[0]
            .as_i64()
            .ok_or_else(|| RpcError::DecodeHeadFailed("expected an integer version tag".into()))?;
        if version != THRIFT_VERSION_1 {
            return Err(RpcError::DecodeHeadFailed(format!("bad json version tag: {version}")));
        }
        let name = arr[1]
            .as_str()
            .ok_or_else(|| RpcError::DecodeHeadFailed("expected a message name string".into()))?
            .to_owned();
        let mtype = MessageType::try_from(as_i64(&arr[2])? as i8)?;
        let session_id = as_i64(&arr[3])? as u64;
        self.pending_read_body = Some(arr[4].clone());
        self.read_stack.clear();
        self.staged = None;
        Ok((name, mtype, session_id))
    }

    fn read_message_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn read_struct_begin(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        let value = self.take_pending()?;
        let obj = value
            .as_object()
            .ok_or_else(|| RpcError::DecodeBodyFailed("expected a JSON object for a struct".into()))?;
        let mut remaining = Vec::with_capacity(obj.len());
        for (key, wrapped) in obj {
            let id: i16 = key
                .parse()
                .map_err(|_| RpcError::DecodeBodyFailed(format!("bad field id {key}")))?;
            let pair = wrapped
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| RpcError::DecodeBodyFailed("expected [type, value] field wrapper".into()))?;
            let ttype = TType::from_u8(as_i64(&pair[0])? as u8)?;
            remaining.push((id, ttype, pair[1].clone()));
        }
        // `read_field_begin` consumes this back-to-front via `pop`, so
        // reverse once here to hand fields out in the order they were
        // written.
        remaining.reverse();
        self.read_stack.push(ReadFrame::Struct { remaining });
        Ok(())
    }

    fn read_struct_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.read_stack.pop();
        Ok(())
    }

    fn read_field_begin(&mut self, _buf: &mut MemoryBuffer) -> Result<(TType, i16), RpcError> {
        match self.read_stack.last_mut() {
            Some(ReadFrame::Struct { remaining }) => match remaining.pop() {
                Some((id, ttype, value)) => {
                    self.staged = Some(value);
                    Ok((ttype, id))
                },
                None => Ok((TType::Stop, 0)),
            },
            _ => Err(RpcError::ProtocolException("field_begin outside a struct".into())),
        }
    }

    fn read_field_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        Ok(())
    }

    fn read_map_begin(&mut self, _buf: &mut MemoryBuffer) -> Result<(TType, TType, usize), RpcError> {
        let value = self.take_pending()?;
        let kt = TType::from_u8(as_i64(&value["kt"])? as u8)?;
        let vt = TType::from_u8(as_i64(&value["vt"])? as u8)?;
        let size = as_i64(&value["sz"])? as usize;
        let pairs = if let Some(obj) = value.get("obj").and_then(Json::as_object) {
            obj.iter().map(|(k, v)| (Json::String(k.clone()), v.clone())).collect()
        } else {
            let keys = value
                .get("keys")
                .and_then(Json::as_array)
                .ok_or_else(|| RpcError::DecodeBodyFailed("map missing keys array".into()))?;
            let vals = value
                .get("vals")
                .and_then(Json::as_array)
                .ok_or_else(|| RpcError::DecodeBodyFailed("map missing vals array".into()))?;
            keys.iter().cloned().zip(vals.iter().cloned()).collect()
        };
        self.read_stack.push(ReadFrame::Map { kt, vt, pairs, pos: 0 });
        Ok((kt, vt, size))
    }

    fn read_map_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.read_stack.pop();
        Ok(())
    }

    fn read_list_begin(&mut self, _buf: &mut MemoryBuffer) -> Result<(TType, usize), RpcError> {
        let value = self.take_pending()?;
        let et = TType::from_u8(as_i64(&value["et"])? as u8)?;
        let items = value
            .get("items")
            .and_then(Json::as_array)
            .ok_or_else(|| RpcError::DecodeBodyFailed("list missing items array".into()))?
            .clone();
        let size = items.len();
        self.read_stack.push(ReadFrame::List { items, pos: 0 });
        Ok((et, size))
    }

    fn read_list_end(&mut self, _buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.read_stack.pop();
        Ok(())
    }

    fn read_set_begin(&mut self, buf: &mut MemoryBuffer) -> Result<(TType, usize), RpcError> {
        self.read_list_begin(buf)
    }

    fn read_set_end(&mut self, buf: &mut MemoryBuffer) -> Result<(), RpcError> {
        self.read_list_end(buf)
    }

    fn read_bool(&mut self, _buf: &mut MemoryBuffer) -> Result<bool, RpcError> {
        let v = self.take_pending()?;
        v.as_bool().ok_or_else(|| RpcError::DecodeBodyFailed("expected bool".into()))
    }

    fn read_byte(&mut self, _buf: &mut MemoryBuffer) -> Result<i8, RpcError> {
        let v = self.take_pending()?;
        Ok(as_i64(&v)? as i8)
    }

    fn read_i16(&mut self, _buf: &mut MemoryBuffer) -> Result<i16, RpcError> {
        let v = self.take_pending()?;
        Ok(as_i64(&v)? as i16)
    }

    fn read_i32(&mut self, _buf: &mut MemoryBuffer) -> Result<i32, RpcError> {
        let v = self.take_pending()?;
        Ok(as_i64(&v)? as i32)
    }

    fn read_i64(&mut self, _buf: &mut MemoryBuffer) -> Result<i64, RpcError> {
        let v = self.take_pending()?;
        as_i64(&v)
    }

    fn read_double(&mut self, _buf: &mut MemoryBuffer) -> Result<f64, RpcError> {
        let v = self.take_pending()?;
        v.as_f64()
            .ok_or_else(|| RpcError::DecodeBodyFailed("expected double".into()))
    }

    fn read_string(&mut self, _buf: &mut MemoryBuffer) -> Result<String, RpcError> {
        let v = self.take_pending()?;
        v.as_str()
            .map(str::to_owned)
            .ok_or_else(|| RpcError::DecodeBodyFailed("expected string".into()))
    }

    fn read_binary(&mut self, _buf: &mut MemoryBuffer) -> Result<Bytes, RpcError> {
        let v = self.take_pending()?;
        let s = v
            .as_str()
            .ok_or_else(|| RpcError::DecodeBodyFailed("expected base64 string".into()))?;
        let decoded = BASE64
            .decode(s)
            .map_err(|e| RpcError::DecodeBodyFailed(format!("bad base64 binary: {e}")))?;
        Ok(Bytes::from(decoded))
    }
}

impl JsonCodec {
    fn end_list_like(&mut self, ttype: TType) -> Result<(), RpcError> {
        let frame = self
            .write_stack
            .pop()
            .ok_or_else(|| RpcError::ProtocolException("list/set end without a matching begin".into()))?;
        let WriteFrame::List { elem_ty, items } = frame else {
            return Err(RpcError::ProtocolException("mismatched list/set end".into()));
        };
        let wrapped = json!({"et": elem_ty as u8, "sz": items.len(), "items": items});
        self.attach_typed(ttype, wrapped)
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

    #[test]
    fn round_trips_struct_body() {
        let mut codec = JsonCodec::default();
        let mut out = MemoryBuffer::owned(256);
        let value = sample_struct();
        codec
            .write_message_begin(&mut out, "HelloWorld:hello", MessageType::Call, 7)
            .expect("write message begin");
        encode_value(&mut codec, &mut out, &value).expect("encode");
        codec.write_message_end(&mut out).expect("write message end");

        let bytes = out.into_bytes();
        let mut input = MemoryBuffer::observe(bytes);
        let (name, mtype, sid) = codec.read_message_begin(&mut input).expect("decode head");
        assert_eq!(name, "HelloWorld:hello");
        assert_eq!(mtype, MessageType::Call);
        assert_eq!(sid, 7);

        let decoded = decode_value(&mut codec, &mut input, TType::Struct).expect("decode body");
        assert_eq!(decoded, value);
    }

    #[test]
    fn binary_round_trips_as_base64() {
        let mut codec = JsonCodec::default();
        let mut out = MemoryBuffer::owned(64);
        codec
            .write_message_begin(&mut out, "Svc:op", MessageType::Call, 1)
            .expect("write message begin");
        codec.write_binary(&mut out, b"\x00\x01\xff").expect("encode");
        codec.write_message_end(&mut out).expect("write message end");

        let bytes = out.into_bytes();
        let mut input = MemoryBuffer::observe(bytes);
        codec.read_message_begin(&mut input).expect("decode head");
        let decoded = codec.read_binary(&mut input).expect("decode binary");
        assert_eq!(decoded.as_ref(), b"\x00\x01\xff");
    }
}
