//! Record codecs: how records become chunk payload bytes and back.
//!
//! The transport never looks inside a payload. A codec must be
//! self-delimiting, since one payload carries any number of records
//! concatenated and a receiver decodes them all from one slice.

use std::marker::PhantomData;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

const MAX_VARINT_LEN: usize = 10;

/// Errors raised while encoding or decoding records.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload ended inside a record.
    #[error("truncated record: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// A length prefix was not a valid varint.
    #[error("invalid length prefix: {0}")]
    InvalidLength(String),

    /// A string record was not valid UTF-8.
    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// A JSON record failed to (de)serialize.
    #[error("json record: {0}")]
    Json(#[from] serde_json::Error),

    /// Codec-specific failure.
    #[error("{0}")]
    Invalid(String),
}

/// Converts between typed records and opaque payload bytes.
pub trait Codec: Send + 'static {
    type Record;

    /// Append the encoded form of `record` to `dst`.
    fn encode(&self, record: &Self::Record, dst: &mut BytesMut) -> Result<(), CodecError>;

    /// Decode every record in `src`, in order.
    fn decode(&self, src: &[u8]) -> Result<Vec<Self::Record>, CodecError>;
}

/// Write `value` as an unsigned LEB128 varint.
pub fn put_varint(mut value: u64, dst: &mut BytesMut) {
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Read an unsigned LEB128 varint from the front of `src`, advancing it.
pub fn get_varint(src: &mut &[u8]) -> Result<u64, CodecError> {
    let mut value = 0u64;
    for (index, &byte) in src.iter().enumerate().take(MAX_VARINT_LEN) {
        let bits = u64::from(byte & 0x7F);
        if index == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(CodecError::InvalidLength("varint overflows u64".to_string()));
        }
        value |= bits << (7 * index);
        if byte & 0x80 == 0 {
            *src = &src[index + 1..];
            return Ok(value);
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        return Err(CodecError::InvalidLength(
            "varint longer than 10 bytes".to_string(),
        ));
    }
    Err(CodecError::Truncated {
        needed: src.len() + 1,
        available: src.len(),
    })
}

fn put_length_prefixed(bytes: &[u8], dst: &mut BytesMut) {
    put_varint(bytes.len() as u64, dst);
    dst.put_slice(bytes);
}

fn split_records(mut src: &[u8]) -> Result<Vec<&[u8]>, CodecError> {
    let mut records = Vec::new();
    while !src.is_empty() {
        let len = get_varint(&mut src)?;
        let len = usize::try_from(len)
            .map_err(|_| CodecError::InvalidLength(format!("record length {len}")))?;
        if src.len() < len {
            return Err(CodecError::Truncated {
                needed: len,
                available: src.len(),
            });
        }
        let (record, rest) = src.split_at(len);
        records.push(record);
        src = rest;
    }
    Ok(records)
}

/// Length-prefixed byte-string records.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Record = Bytes;

    fn encode(&self, record: &Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        put_length_prefixed(record, dst);
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> Result<Vec<Bytes>, CodecError> {
        Ok(split_records(src)?
            .into_iter()
            .map(Bytes::copy_from_slice)
            .collect())
    }
}

/// Length-prefixed UTF-8 string records.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec for Utf8Codec {
    type Record = String;

    fn encode(&self, record: &String, dst: &mut BytesMut) -> Result<(), CodecError> {
        put_length_prefixed(record.as_bytes(), dst);
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> Result<Vec<String>, CodecError> {
        split_records(src)?
            .into_iter()
            .map(|record| Ok(std::str::from_utf8(record)?.to_string()))
            .collect()
    }
}

/// One length-prefixed JSON document per record.
pub struct JsonCodec<T> {
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _record: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonCodec")
            .field("record", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    type Record = T;

    fn encode(&self, record: &T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let json = serde_json::to_vec(record)?;
        put_length_prefixed(&json, dst);
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> Result<Vec<T>, CodecError> {
        split_records(src)?
            .into_iter()
            .map(|record| Ok(serde_json::from_slice(record)?))
            .collect()
    }
}
