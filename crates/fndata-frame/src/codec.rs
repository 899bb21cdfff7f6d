use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::endpoint::LogicalEndpoint;
use crate::error::{FrameError, Result};

/// Message header: magic (2) + body length (4) + kind (1) + version (1) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "FD" (0x46 0x44).
pub const MAGIC: [u8; 2] = [0x46, 0x44];

/// Wire version written in every header.
pub const WIRE_VERSION: u8 = 1;

/// Message kind: UTF-8 JSON connection-management payload.
pub const KIND_CONTROL: u8 = 0;

/// Message kind: a sequence of element chunks.
pub const KIND_ELEMENTS: u8 = 1;

/// Default maximum message body size: 16 MiB.
pub const DEFAULT_MAX_MESSAGE: usize = 16 * 1024 * 1024;

const FLAG_LAST: u8 = 0b0000_0001;
const FLAG_TIMER: u8 = 0b0000_0010;
const KNOWN_FLAGS: u8 = FLAG_LAST | FLAG_TIMER;

/// Smallest possible encoded chunk: flags + two empty ids + payload length.
const MIN_CHUNK_SIZE: usize = 1 + 2 + 2 + 4;

/// A run of encoded records for one logical endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The stream this chunk belongs to.
    pub endpoint: LogicalEndpoint,
    /// Zero or more complete encoded records, concatenated.
    pub payload: Bytes,
    /// End of stream for `endpoint`.
    pub is_last: bool,
}

impl Chunk {
    /// A data-carrying chunk.
    pub fn data(endpoint: LogicalEndpoint, payload: impl Into<Bytes>) -> Self {
        Self {
            endpoint,
            payload: payload.into(),
            is_last: false,
        }
    }

    /// The empty end-of-stream chunk.
    pub fn last(endpoint: LogicalEndpoint) -> Self {
        Self {
            endpoint,
            payload: Bytes::new(),
            is_last: true,
        }
    }

    /// Encoded size of this chunk inside an ELEMENTS body.
    pub fn wire_size(&self) -> usize {
        let timer = self
            .endpoint
            .timer_family_id()
            .map_or(0, |family| 2 + family.len());
        MIN_CHUNK_SIZE
            + self.endpoint.instruction_id().len()
            + self.endpoint.transform_id().len()
            + timer
            + self.payload.len()
    }
}

/// One physical message on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Connection management (handshake). Body is JSON.
    Control(Bytes),
    /// Multiplexed element chunks, applied in order.
    Elements(Vec<Chunk>),
}

impl Message {
    /// The kind byte written in the header.
    pub fn kind(&self) -> u8 {
        match self {
            Message::Control(_) => KIND_CONTROL,
            Message::Elements(_) => KIND_ELEMENTS,
        }
    }

    /// Size of the body that follows the header.
    pub fn body_len(&self) -> usize {
        match self {
            Message::Control(payload) => payload.len(),
            Message::Elements(chunks) => elements_body_len(chunks),
        }
    }
}

/// Body size of an ELEMENTS message holding `chunks`.
pub fn elements_body_len(chunks: &[Chunk]) -> usize {
    4 + chunks.iter().map(Chunk::wire_size).sum::<usize>()
}

/// Encode a message into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────────────┬──────────┬───────────┬────────────────┐
/// │ Magic (2B) │ Length (4B)  │ Kind (1B)│ Ver. (1B) │ Body           │
/// │ 0x46 0x44  │ LE, body only│ 0 | 1    │ 1         │ (Length bytes) │
/// └────────────┴──────────────┴──────────┴───────────┴────────────────┘
///
/// ELEMENTS body:
///   count (4B LE), then per chunk:
///   flags (1B: bit0 last, bit1 timer)
///   instruction id (2B LE len + UTF-8)
///   transform id   (2B LE len + UTF-8)
///   timer family   (2B LE len + UTF-8, only when bit1 is set)
///   payload        (4B LE len + bytes)
/// ```
pub fn encode_message(message: &Message, dst: &mut BytesMut) -> Result<()> {
    match message {
        Message::Control(payload) => encode_control(payload, dst),
        Message::Elements(chunks) => encode_elements(chunks, dst),
    }
}

/// Encode a CONTROL message.
pub fn encode_control(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    put_header(KIND_CONTROL, payload.len(), dst)?;
    dst.put_slice(payload);
    Ok(())
}

/// Encode an ELEMENTS message directly from a chunk slice.
pub fn encode_elements(chunks: &[Chunk], dst: &mut BytesMut) -> Result<()> {
    for chunk in chunks {
        check_id("instruction id", chunk.endpoint.instruction_id())?;
        check_id("transform id", chunk.endpoint.transform_id())?;
        if let Some(family) = chunk.endpoint.timer_family_id() {
            check_id("timer family id", family)?;
        }
        if chunk.payload.len() > u32::MAX as usize {
            return Err(FrameError::MessageTooLarge {
                size: chunk.payload.len(),
                max: u32::MAX as usize,
            });
        }
    }
    if chunks.len() > u32::MAX as usize {
        return Err(FrameError::Malformed(format!(
            "too many chunks in one message: {}",
            chunks.len()
        )));
    }

    put_header(KIND_ELEMENTS, elements_body_len(chunks), dst)?;
    dst.put_u32_le(chunks.len() as u32);
    for chunk in chunks {
        let mut flags = 0u8;
        if chunk.is_last {
            flags |= FLAG_LAST;
        }
        if chunk.endpoint.is_timer() {
            flags |= FLAG_TIMER;
        }
        dst.put_u8(flags);
        put_id(chunk.endpoint.instruction_id(), dst);
        put_id(chunk.endpoint.transform_id(), dst);
        if let Some(family) = chunk.endpoint.timer_family_id() {
            put_id(family, dst);
        }
        dst.put_u32_le(chunk.payload.len() as u32);
        dst.put_slice(&chunk.payload);
    }
    Ok(())
}

fn put_header(kind: u8, body_len: usize, dst: &mut BytesMut) -> Result<()> {
    if body_len > u32::MAX as usize {
        return Err(FrameError::MessageTooLarge {
            size: body_len,
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + body_len);
    dst.put_slice(&MAGIC);
    dst.put_u32_le(body_len as u32);
    dst.put_u8(kind);
    dst.put_u8(WIRE_VERSION);
    Ok(())
}

fn check_id(field: &'static str, id: &str) -> Result<()> {
    if id.len() > u16::MAX as usize {
        return Err(FrameError::FieldTooLong {
            field,
            len: id.len(),
        });
    }
    Ok(())
}

fn put_id(id: &str, dst: &mut BytesMut) {
    dst.put_u16_le(id.len() as u16);
    dst.put_slice(id.as_bytes());
}

/// Decode a message from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete message yet.
/// On success, consumes the message bytes from the buffer. Header problems
/// are reported as soon as the header is available.
pub fn decode_message(src: &mut BytesMut, max_message: usize) -> Result<Option<Message>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let body_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let kind = src[6];
    let version = src[7];

    if version != WIRE_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    if kind != KIND_CONTROL && kind != KIND_ELEMENTS {
        return Err(FrameError::UnknownKind(kind));
    }
    if body_len > max_message {
        return Err(FrameError::MessageTooLarge {
            size: body_len,
            max: max_message,
        });
    }

    if src.len() < HEADER_SIZE + body_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let body = src.split_to(body_len).freeze();

    match kind {
        KIND_CONTROL => Ok(Some(Message::Control(body))),
        _ => decode_elements(body).map(|chunks| Some(Message::Elements(chunks))),
    }
}

fn decode_elements(mut body: Bytes) -> Result<Vec<Chunk>> {
    let count = take_u32(&mut body, "chunk count")? as usize;
    if count.saturating_mul(MIN_CHUNK_SIZE) > body.remaining() {
        return Err(FrameError::Malformed(format!(
            "{count} chunks cannot fit in {} bytes",
            body.remaining()
        )));
    }

    let mut chunks = Vec::with_capacity(count);
    for index in 0..count {
        let flags = take_u8(&mut body, "chunk flags")?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(FrameError::Malformed(format!(
                "chunk {index}: unknown flag bits {flags:#04x}"
            )));
        }
        let instruction_id = take_id(&mut body, "instruction id")?;
        let transform_id = take_id(&mut body, "transform id")?;
        let endpoint = if flags & FLAG_TIMER != 0 {
            let family = take_id(&mut body, "timer family id")?;
            LogicalEndpoint::timer(instruction_id, transform_id, family)
        } else {
            LogicalEndpoint::data(instruction_id, transform_id)
        };

        let payload_len = take_u32(&mut body, "payload length")? as usize;
        if body.remaining() < payload_len {
            return Err(FrameError::Malformed(format!(
                "chunk {index}: payload of {payload_len} bytes truncated to {}",
                body.remaining()
            )));
        }
        let payload = body.split_to(payload_len);

        chunks.push(Chunk {
            endpoint,
            payload,
            is_last: flags & FLAG_LAST != 0,
        });
    }

    if body.has_remaining() {
        return Err(FrameError::Malformed(format!(
            "{} trailing bytes after {count} chunks",
            body.remaining()
        )));
    }
    Ok(chunks)
}

fn take_u8(body: &mut Bytes, what: &str) -> Result<u8> {
    if body.remaining() < 1 {
        return Err(truncated(what));
    }
    Ok(body.get_u8())
}

fn take_u32(body: &mut Bytes, what: &str) -> Result<u32> {
    if body.remaining() < 4 {
        return Err(truncated(what));
    }
    Ok(body.get_u32_le())
}

fn take_id(body: &mut Bytes, what: &str) -> Result<String> {
    if body.remaining() < 2 {
        return Err(truncated(what));
    }
    let len = body.get_u16_le() as usize;
    if body.remaining() < len {
        return Err(truncated(what));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| FrameError::Malformed(format!("{what} is not valid UTF-8")))
}

fn truncated(what: &str) -> FrameError {
    FrameError::Malformed(format!("truncated {what}"))
}

/// Configuration for message reading and writing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum message body size in bytes. Default: 16 MiB.
    pub max_message_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(transform: &str) -> LogicalEndpoint {
        LogicalEndpoint::data("bundle-7", transform)
    }

    #[test]
    fn elements_roundtrip_preserves_chunk_order() {
        let chunks = vec![
            Chunk::data(endpoint("a"), Bytes::from_static(b"one")),
            Chunk::data(LogicalEndpoint::timer("bundle-7", "a", "gc"), Bytes::from_static(b"t")),
            Chunk::data(endpoint("b"), Bytes::from_static(b"two")),
            Chunk::last(endpoint("a")),
        ];
        let mut buf = BytesMut::new();
        encode_elements(&chunks, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + elements_body_len(&chunks));

        let decoded = decode_message(&mut buf, DEFAULT_MAX_MESSAGE).unwrap().unwrap();
        assert_eq!(decoded, Message::Elements(chunks));
        assert!(buf.is_empty());
    }

    #[test]
    fn control_roundtrip() {
        let mut buf = BytesMut::new();
        encode_control(br#"{"protocol":"fndata"}"#, &mut buf).unwrap();

        let decoded = decode_message(&mut buf, DEFAULT_MAX_MESSAGE).unwrap().unwrap();
        assert_eq!(decoded.kind(), KIND_CONTROL);
        assert_eq!(
            decoded,
            Message::Control(Bytes::from_static(br#"{"protocol":"fndata"}"#))
        );
    }

    #[test]
    fn empty_elements_message_is_valid() {
        let mut buf = BytesMut::new();
        encode_message(&Message::Elements(Vec::new()), &mut buf).unwrap();
        let decoded = decode_message(&mut buf, DEFAULT_MAX_MESSAGE).unwrap().unwrap();
        assert_eq!(decoded, Message::Elements(Vec::new()));
    }

    #[test]
    fn incomplete_header_and_body_wait_for_more() {
        let mut short = BytesMut::from(&MAGIC[..]);
        assert!(decode_message(&mut short, DEFAULT_MAX_MESSAGE).unwrap().is_none());

        let mut buf = BytesMut::new();
        encode_elements(&[Chunk::data(endpoint("a"), Bytes::from_static(b"hello"))], &mut buf)
            .unwrap();
        let full_len = buf.len();
        buf.truncate(full_len - 2);
        assert!(decode_message(&mut buf, DEFAULT_MAX_MESSAGE).unwrap().is_none());
        assert_eq!(buf.len(), full_len - 2, "nothing consumed on partial input");
    }

    #[test]
    fn rejects_bad_header_fields() {
        let mut bad_magic = BytesMut::from(&[0xFF, 0xFF, 0, 0, 0, 0, 0, 1][..]);
        assert!(matches!(
            decode_message(&mut bad_magic, DEFAULT_MAX_MESSAGE),
            Err(FrameError::InvalidMagic)
        ));

        let mut bad_version = BytesMut::from(&[0x46, 0x44, 0, 0, 0, 0, 0, 9][..]);
        assert!(matches!(
            decode_message(&mut bad_version, DEFAULT_MAX_MESSAGE),
            Err(FrameError::UnsupportedVersion(9))
        ));

        let mut bad_kind = BytesMut::from(&[0x46, 0x44, 0, 0, 0, 0, 7, 1][..]);
        assert!(matches!(
            decode_message(&mut bad_kind, DEFAULT_MAX_MESSAGE),
            Err(FrameError::UnknownKind(7))
        ));
    }

    #[test]
    fn rejects_oversized_body_before_buffering_it() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(32 * 1024 * 1024);
        buf.put_u8(KIND_ELEMENTS);
        buf.put_u8(WIRE_VERSION);

        assert!(matches!(
            decode_message(&mut buf, DEFAULT_MAX_MESSAGE),
            Err(FrameError::MessageTooLarge { .. })
        ));
    }

    fn elements_with_body(body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(body.len() as u32);
        buf.put_u8(KIND_ELEMENTS);
        buf.put_u8(WIRE_VERSION);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn rejects_truncated_chunk() {
        let mut body = BytesMut::new();
        body.put_u32_le(1);
        body.put_u8(0);
        body.put_u16_le(1);
        body.put_slice(b"i");
        body.put_u16_le(1);
        body.put_slice(b"t");
        body.put_u32_le(10);
        body.put_slice(b"short");

        let mut buf = elements_with_body(&body);
        assert!(matches!(
            decode_message(&mut buf, DEFAULT_MAX_MESSAGE),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_unknown_flags_and_trailing_bytes() {
        let mut body = BytesMut::new();
        body.put_u32_le(1);
        body.put_u8(0b1000_0000);
        body.put_u16_le(0);
        body.put_u16_le(0);
        body.put_u32_le(0);
        let mut buf = elements_with_body(&body);
        assert!(matches!(
            decode_message(&mut buf, DEFAULT_MAX_MESSAGE),
            Err(FrameError::Malformed(_))
        ));

        let mut body = BytesMut::new();
        body.put_u32_le(0);
        body.put_u8(0xAA);
        let mut buf = elements_with_body(&body);
        assert!(matches!(
            decode_message(&mut buf, DEFAULT_MAX_MESSAGE),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_implausible_chunk_count() {
        let mut body = BytesMut::new();
        body.put_u32_le(u32::MAX);
        let mut buf = elements_with_body(&body);
        assert!(matches!(
            decode_message(&mut buf, DEFAULT_MAX_MESSAGE),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_non_utf8_ids() {
        let mut body = BytesMut::new();
        body.put_u32_le(1);
        body.put_u8(0);
        body.put_u16_le(2);
        body.put_slice(&[0xC3, 0x28]);
        body.put_u16_le(0);
        body.put_u32_le(0);
        let mut buf = elements_with_body(&body);
        assert!(matches!(
            decode_message(&mut buf, DEFAULT_MAX_MESSAGE),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn encode_rejects_overlong_ids() {
        let long = "x".repeat(u16::MAX as usize + 1);
        let chunk = Chunk::data(LogicalEndpoint::data(long, "t"), Bytes::new());
        let err = encode_elements(&[chunk], &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, FrameError::FieldTooLong { field: "instruction id", .. }));
    }

    #[test]
    fn back_to_back_messages_decode_in_order() {
        let mut buf = BytesMut::new();
        encode_control(b"{}", &mut buf).unwrap();
        encode_elements(&[Chunk::last(endpoint("z"))], &mut buf).unwrap();

        let first = decode_message(&mut buf, DEFAULT_MAX_MESSAGE).unwrap().unwrap();
        let second = decode_message(&mut buf, DEFAULT_MAX_MESSAGE).unwrap().unwrap();
        assert_eq!(first.kind(), KIND_CONTROL);
        assert_eq!(second, Message::Elements(vec![Chunk::last(endpoint("z"))]));
        assert!(buf.is_empty());
    }

    #[test]
    fn chunk_wire_size_matches_encoding() {
        let chunk = Chunk::data(
            LogicalEndpoint::timer("abc", "de", "f"),
            Bytes::from_static(b"12345"),
        );
        let mut buf = BytesMut::new();
        encode_elements(std::slice::from_ref(&chunk), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 4 + chunk.wire_size());
        assert_eq!(chunk.wire_size(), 9 + 3 + 2 + 3 + 5);
    }
}
