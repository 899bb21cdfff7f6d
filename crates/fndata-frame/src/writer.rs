use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use fndata_transport::DataStream;

use crate::codec::{
    elements_body_len, encode_control, encode_elements, Chunk, FrameConfig, Message,
};
use crate::error::{FrameError, Result};
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 64 * 1024;

/// Writes complete messages to any `Write` stream.
///
/// Each call encodes the whole message first and then writes it out, so a
/// caller holding the writer exclusively never interleaves two messages.
pub struct MessageWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> MessageWriter<T> {
    /// Create a new message writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new message writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete message (blocking).
    pub fn write_message(&mut self, message: &Message) -> Result<()> {
        match message {
            Message::Control(payload) => self.write_control(payload),
            Message::Elements(chunks) => self.write_elements(chunks),
        }
    }

    /// Encode and send a CONTROL message.
    pub fn write_control(&mut self, payload: &[u8]) -> Result<()> {
        self.check_size(payload.len())?;
        self.buf.clear();
        encode_control(payload, &mut self.buf)?;
        self.write_buffered()
    }

    /// Encode and send an ELEMENTS message holding `chunks`, in order.
    pub fn write_elements(&mut self, chunks: &[Chunk]) -> Result<()> {
        self.check_size(elements_body_len(chunks))?;
        self.buf.clear();
        encode_elements(chunks, &mut self.buf)?;
        self.write_buffered()
    }

    fn check_size(&self, body_len: usize) -> Result<()> {
        if body_len > self.config.max_message_size {
            return Err(FrameError::MessageTooLarge {
                size: body_len,
                max: self.config.max_message_size,
            });
        }
        Ok(())
    }

    fn write_buffered(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum message size for subsequent encoding.
    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.config.max_message_size = max_message_size;
    }

    /// Current writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl MessageWriter<DataStream> {
    /// Create a writer over a `DataStream`, applying the configured write timeout.
    pub fn for_stream(inner: DataStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the write timeout of the underlying stream.
    pub fn set_write_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner
            .set_write_timeout(timeout)
            .map_err(transport_to_frame_error)?;
        self.config.write_timeout = timeout;
        Ok(())
    }
}
