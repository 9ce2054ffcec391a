//! Key and row encoding for KeeperMap nodes.
//!
//! A row is stored as one data node directly under the table's root path:
//!
//! ```text
//! node name: base64url_nopad( binary(primary key) )
//! node data: binary(col_0) | binary(col_1) | ...   (every non-key column, in schema order)
//! ```
//!
//! Binary layout per type: `Bool` is one byte, `UInt64`/`Int64`/`Float64` are
//! 8 bytes little-endian, `String`/`Binary` are a `u32` little-endian length
//! followed by the bytes.
//!
//! URL-safe base64 without padding keeps every name a legal single path
//! segment, even for binary keys, and canonical decoding keeps the mapping
//! injective.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::model::{DataType, Row, Schema, Value};

/// Name of the metadata subtree under every root path.
pub const METADATA_NODE: &str = "ch_metadata";

/// Appends the binary form of `value` to `buf`.
pub fn serialize_value(value: &Value, buf: &mut BytesMut) -> Result<()> {
    match value {
        Value::Bool(v) => buf.put_u8(u8::from(*v)),
        Value::UInt64(v) => buf.put_u64_le(*v),
        Value::Int64(v) => buf.put_i64_le(*v),
        Value::Float64(v) => buf.put_f64_le(*v),
        Value::String(v) => {
            buf.put_u32_le(length_prefix(v.len(), DataType::String)?);
            buf.extend_from_slice(v.as_bytes());
        }
        Value::Binary(v) => {
            buf.put_u32_le(length_prefix(v.len(), DataType::Binary)?);
            buf.extend_from_slice(v);
        }
    }
    Ok(())
}

fn length_prefix(len: usize, data_type: DataType) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        Error::Encoding(format!(
            "{:?} value of {} bytes exceeds the maximum length of {} bytes",
            data_type,
            len,
            u32::MAX
        ))
    })
}

fn ensure_remaining(buf: &[u8], needed: usize, data_type: DataType) -> Result<()> {
    if buf.len() < needed {
        return Err(Error::Encoding(format!(
            "Buffer too short for {:?}: need {} bytes, have {}",
            data_type,
            needed,
            buf.len()
        )));
    }
    Ok(())
}

/// Reads one value of `data_type` from the front of `buf`, advancing it.
pub fn deserialize_value(data_type: DataType, buf: &mut &[u8]) -> Result<Value> {
    match data_type {
        DataType::Bool => {
            ensure_remaining(*buf, 1, data_type)?;
            Ok(Value::Bool(buf.get_u8() != 0))
        }
        DataType::UInt64 => {
            ensure_remaining(*buf, 8, data_type)?;
            Ok(Value::UInt64(buf.get_u64_le()))
        }
        DataType::Int64 => {
            ensure_remaining(*buf, 8, data_type)?;
            Ok(Value::Int64(buf.get_i64_le()))
        }
        DataType::Float64 => {
            ensure_remaining(*buf, 8, data_type)?;
            Ok(Value::Float64(buf.get_f64_le()))
        }
        DataType::String | DataType::Binary => {
            ensure_remaining(*buf, 4, data_type)?;
            let len = buf.get_u32_le() as usize;
            ensure_remaining(*buf, len, data_type)?;
            let data: &[u8] = *buf;
            let (payload, rest) = data.split_at(len);
            let value = if data_type == DataType::String {
                let s = std::str::from_utf8(payload)
                    .map_err(|e| Error::Encoding(format!("Invalid UTF-8: {}", e)))?;
                Value::String(s.to_string())
            } else {
                Value::Binary(Bytes::copy_from_slice(payload))
            };
            *buf = rest;
            Ok(value)
        }
    }
}

/// Turns raw serialized key bytes into a node name.
pub fn encode_raw_key(raw: &[u8]) -> Result<String> {
    let name = URL_SAFE_NO_PAD.encode(raw);
    if name == METADATA_NODE {
        // unreachable for canonical base64, kept as a hard guard
        return Err(Error::Encoding(format!(
            "key encodes to reserved node name '{}'",
            METADATA_NODE
        )));
    }
    Ok(name)
}

/// Encodes a primary-key value into a node name.
pub fn encode_key(value: &Value) -> Result<String> {
    let mut buf = BytesMut::new();
    serialize_value(value, &mut buf)?;
    encode_raw_key(&buf)
}

/// Decodes a node name back into the primary-key value it was encoded from.
pub fn decode_key(name: &str, data_type: DataType) -> Result<Value> {
    let raw = URL_SAFE_NO_PAD
        .decode(name)
        .map_err(|e| Error::Encoding(format!("invalid key node name '{}': {}", name, e)))?;
    let mut slice = raw.as_slice();
    let value = deserialize_value(data_type, &mut slice)?;
    if !slice.is_empty() {
        return Err(Error::Encoding(format!(
            "key node name '{}' has {} trailing bytes",
            name,
            slice.len()
        )));
    }
    Ok(value)
}

/// Encodes a row into its node name and node data.
///
/// The row must already be validated against `schema`.
pub fn encode_row(schema: &Schema, row: &[Value]) -> Result<(String, Bytes)> {
    let key_pos = schema.primary_key_position();
    let key = encode_key(&row[key_pos])?;
    let mut value = BytesMut::new();
    for (idx, cell) in row.iter().enumerate() {
        if idx != key_pos {
            serialize_value(cell, &mut value)?;
        }
    }
    Ok((key, value.freeze()))
}

/// Rebuilds a full row from a node name and its data.
pub fn decode_row(schema: &Schema, name: &str, data: &[u8]) -> Result<Row> {
    let key_pos = schema.primary_key_position();
    let mut slice = data;
    let mut row = Vec::with_capacity(schema.columns().len());
    for (idx, column) in schema.columns().iter().enumerate() {
        if idx == key_pos {
            row.push(decode_key(name, column.data_type)?);
        } else {
            row.push(deserialize_value(column.data_type, &mut slice)?);
        }
    }
    if !slice.is_empty() {
        return Err(Error::Encoding(format!(
            "value of '{}' has {} trailing bytes",
            name,
            slice.len()
        )));
    }
    Ok(row)
}
