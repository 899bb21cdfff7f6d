//! `tokio_util::codec` adapter for the message wire format.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_message, encode_message, FrameConfig, Message, DEFAULT_MAX_MESSAGE};
use crate::error::{FrameError, Result};

/// Frames [`Message`]s over any `AsyncRead`/`AsyncWrite` via
/// `FramedRead`/`FramedWrite`.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE,
        }
    }

    pub fn with_config(config: &FrameConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        decode_message(src, self.max_message_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let body_len = item.body_len();
        if body_len > self.max_message_size {
            return Err(FrameError::MessageTooLarge {
                size: body_len,
                max: self.max_message_size,
            });
        }
        encode_message(&item, dst)
    }
}
