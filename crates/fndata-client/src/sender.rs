use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use fndata_frame::{elements_body_len, Chunk, FrameError, LogicalEndpoint};
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::connection::ConnectionShared;
use crate::error::{DataError, Result};

/// Single-writer handle for one outbound logical endpoint.
///
/// Records are encoded into a local buffer and written as one chunk once the
/// buffer reaches the flush threshold. [`OutboundSender::close`] must be
/// called to end the stream; dropping the handle leaves it open on the
/// receiving side.
pub struct OutboundSender<C: Codec> {
    shared: Arc<ConnectionShared>,
    endpoint: LogicalEndpoint,
    codec: C,
    buffer: BytesMut,
    flush_threshold: usize,
    max_payload: usize,
    closed: bool,
    records_sent: u64,
    bytes_sent: u64,
}

impl<C: Codec> OutboundSender<C> {
    pub(crate) fn new(shared: Arc<ConnectionShared>, endpoint: LogicalEndpoint, codec: C) -> Self {
        let config = shared.config();
        let flush_threshold = config.flush_threshold;
        let max_payload = config.max_chunk_payload(&endpoint);
        debug!(descriptor = %shared.descriptor(), endpoint = %endpoint, "opened outbound stream");
        Self {
            shared,
            endpoint,
            codec,
            buffer: BytesMut::new(),
            flush_threshold,
            max_payload,
            closed: false,
            records_sent: 0,
            bytes_sent: 0,
        }
    }

    pub fn endpoint(&self) -> &LogicalEndpoint {
        &self.endpoint
    }

    /// Encode and buffer one record, writing a chunk if the buffer is full.
    ///
    /// A record that fails to encode, or that alone exceeds the connection's
    /// message size limit, is rejected without affecting buffered records.
    pub fn send(&mut self, record: &C::Record) -> Result<()> {
        self.ensure_open()?;

        let start = self.buffer.len();
        if let Err(err) = self.codec.encode(record, &mut self.buffer) {
            self.buffer.truncate(start);
            return Err(DataError::Codec(err));
        }

        if self.buffer.len() > self.max_payload {
            let record_len = self.buffer.len() - start;
            if record_len > self.max_payload {
                self.buffer.truncate(start);
                return Err(DataError::Frame(FrameError::MessageTooLarge {
                    size: record_len,
                    max: self.max_payload,
                }));
            }
            let pending = self.buffer.split_off(start);
            self.flush_buffer()?;
            self.buffer = pending;
        }

        self.records_sent += 1;
        if self.buffer.len() >= self.flush_threshold {
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Write any buffered records now.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush_buffer()
    }

    /// Write buffered records and the end-of-stream marker.
    ///
    /// Both go out as one message when they fit under the connection's
    /// message size limit; otherwise the buffered records are written first.
    /// The handle is unusable once the marker has been written.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.fits_with_last() {
            self.flush_buffer()?;
        }
        self.write_buffered(true)?;
        self.closed = true;

        debug!(
            descriptor = %self.shared.descriptor(),
            endpoint = %self.endpoint,
            records = self.records_sent,
            bytes = self.bytes_sent,
            "closed outbound stream"
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Records accepted by `send` so far.
    pub fn records_sent(&self) -> u64 {
        self.records_sent
    }

    /// Payload bytes handed to the connection so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Bytes encoded but not yet written.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DataError::SenderClosed(self.endpoint.clone()));
        }
        if self.shared.is_closed() {
            return Err(self.shared.closed_error());
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        self.write_buffered(false)
    }

    /// Whether the buffer and the end-of-stream marker fit in one message.
    fn fits_with_last(&self) -> bool {
        if self.buffer.is_empty() {
            return true;
        }
        let framing = elements_body_len(&[
            Chunk::data(self.endpoint.clone(), Bytes::new()),
            Chunk::last(self.endpoint.clone()),
        ]);
        framing + self.buffer.len() <= self.shared.config().max_message_size
    }

    /// Write the buffer, plus the end-of-stream marker if `last`, as one
    /// message. The buffer is restored when the write is rejected.
    fn write_buffered(&mut self, last: bool) -> Result<()> {
        let mut chunks = Vec::with_capacity(2);
        if !self.buffer.is_empty() {
            chunks.push(Chunk::data(self.endpoint.clone(), self.buffer.split().freeze()));
        }
        if last {
            chunks.push(Chunk::last(self.endpoint.clone()));
        }
        if chunks.is_empty() {
            return Ok(());
        }

        let len = chunks[0].payload.len();
        if let Err(err) = self.shared.write_chunks(&chunks) {
            if len > 0 {
                self.buffer = BytesMut::from(&chunks[0].payload[..]);
            }
            return Err(err);
        }
        self.bytes_sent += len as u64;
        Ok(())
    }
}

impl<C: Codec> Drop for OutboundSender<C> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                descriptor = %self.shared.descriptor(),
                endpoint = %self.endpoint,
                buffered = self.buffer.len(),
                "outbound sender dropped without close; stream left open"
            );
        }
    }
}

impl<C: Codec> std::fmt::Debug for OutboundSender<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundSender")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed)
            .field("records_sent", &self.records_sent)
            .field("bytes_sent", &self.bytes_sent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use fndata_frame::{Message, MessageReader};
    use fndata_transport::DataStream;

    use super::*;
    use crate::codec::{BytesCodec, Utf8Codec};
    use crate::config::ClientConfig;
    use crate::connection::test_support::from_stream;
    use crate::connection::Connection;

    /// A started connection plus a raw reader standing in for the peer.
    fn raw_peer(config: ClientConfig) -> (Connection, MessageReader<DataStream>) {
        let (local, remote) = DataStream::pair().unwrap();
        let connection = from_stream(local, "sender", &config);
        (connection, MessageReader::new(remote))
    }

    fn chunks(message: Message) -> Vec<Chunk> {
        match message {
            Message::Elements(chunks) => chunks,
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn buffers_until_threshold() {
        let config = ClientConfig {
            flush_threshold: 8,
            ..ClientConfig::default()
        };
        let (connection, mut peer) = raw_peer(config);
        let endpoint = LogicalEndpoint::data("i", "t");
        let mut sender = connection.sender(endpoint.clone(), Utf8Codec).unwrap();

        sender.send(&"abc".to_string()).unwrap();
        assert_eq!(sender.buffered_bytes(), 4);
        sender.send(&"defg".to_string()).unwrap();
        assert_eq!(sender.buffered_bytes(), 0);

        let got = chunks(peer.read_message().unwrap());
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].endpoint, endpoint);
        assert_eq!(Utf8Codec.decode(&got[0].payload).unwrap(), vec!["abc", "defg"]);
        assert!(!got[0].is_last);
        assert_eq!(sender.bytes_sent(), 9);
        sender.close().unwrap();
    }

    #[test]
    fn close_sends_remainder_and_last_in_one_message() {
        let (connection, mut peer) = raw_peer(ClientConfig::default());
        let endpoint = LogicalEndpoint::timer("i", "t", "fam");
        let mut sender = connection.sender(endpoint.clone(), Utf8Codec).unwrap();

        sender.send(&"x".to_string()).unwrap();
        sender.close().unwrap();

        let got = chunks(peer.read_message().unwrap());
        assert_eq!(got.len(), 2);
        assert_eq!(Utf8Codec.decode(&got[0].payload).unwrap(), vec!["x"]);
        assert_eq!(got[1], Chunk::last(endpoint));
        assert_eq!(sender.records_sent(), 1);
    }

    #[test]
    fn close_without_records_sends_only_last() {
        let (connection, mut peer) = raw_peer(ClientConfig::default());
        let endpoint = LogicalEndpoint::data("i", "empty");
        let mut sender = connection.sender(endpoint.clone(), Utf8Codec).unwrap();
        sender.flush().unwrap();
        sender.close().unwrap();

        assert_eq!(chunks(peer.read_message().unwrap()), vec![Chunk::last(endpoint)]);
    }

    #[test]
    fn closed_sender_rejects_everything() {
        let (connection, _peer) = raw_peer(ClientConfig::default());
        let endpoint = LogicalEndpoint::data("i", "t");
        let mut sender = connection.sender(endpoint.clone(), Utf8Codec).unwrap();
        sender.close().unwrap();

        assert!(sender.is_closed());
        assert!(matches!(
            sender.send(&"late".to_string()),
            Err(DataError::SenderClosed(ref e)) if *e == endpoint
        ));
        assert!(matches!(sender.flush(), Err(DataError::SenderClosed(_))));
        assert!(matches!(sender.close(), Err(DataError::SenderClosed(_))));
    }

    #[test]
    fn oversized_record_rejected_without_losing_buffer() {
        let config = ClientConfig {
            max_message_size: 64,
            ..ClientConfig::default()
        };
        let (connection, mut peer) = raw_peer(config);
        let endpoint = LogicalEndpoint::data("i", "t");
        let mut sender = connection.sender(endpoint.clone(), BytesCodec).unwrap();

        sender.send(&Bytes::from_static(b"small")).unwrap();
        let err = sender.send(&Bytes::from(vec![0u8; 100])).unwrap_err();
        assert!(matches!(err, DataError::Frame(FrameError::MessageTooLarge { .. })));
        assert_eq!(sender.records_sent(), 1);
        sender.close().unwrap();

        let got = chunks(peer.read_message().unwrap());
        assert_eq!(
            BytesCodec.decode(&got[0].payload).unwrap(),
            vec![Bytes::from_static(b"small")]
        );
        assert!(got[1].is_last);
    }

    #[test]
    fn close_splits_remainder_that_cannot_share_a_message() {
        let config = ClientConfig {
            max_message_size: 64,
            flush_threshold: 1024,
            ..ClientConfig::default()
        };
        let (connection, mut peer) = raw_peer(config);
        let endpoint = LogicalEndpoint::data("i", "t");
        let mut sender = connection.sender(endpoint.clone(), BytesCodec).unwrap();

        // 45 bytes with prefix: a full chunk, with no room for the marker.
        sender.send(&Bytes::from(vec![7u8; 44])).unwrap();
        assert_eq!(sender.buffered_bytes(), 45);
        sender.close().unwrap();
        assert!(sender.is_closed());
        assert_eq!(sender.bytes_sent(), 45);

        let first = chunks(peer.read_message().unwrap());
        assert_eq!(first.len(), 1);
        assert!(!first[0].is_last);
        assert_eq!(
            BytesCodec.decode(&first[0].payload).unwrap(),
            vec![Bytes::from(vec![7u8; 44])]
        );
        assert_eq!(chunks(peer.read_message().unwrap()), vec![Chunk::last(endpoint)]);
    }

    #[test]
    fn rejected_close_keeps_buffer_and_handle_open() {
        let (connection, _peer) = raw_peer(ClientConfig::default());
        let endpoint = LogicalEndpoint::data("i", "x".repeat(70_000));
        let mut sender = connection.sender(endpoint, Utf8Codec).unwrap();

        sender.send(&"kept".to_string()).unwrap();
        let err = sender.close().unwrap_err();
        assert!(matches!(err, DataError::Frame(FrameError::FieldTooLong { .. })));
        assert!(!err.is_connection_error());
        assert!(!sender.is_closed());
        assert_eq!(sender.buffered_bytes(), 5);
        assert!(!connection.is_closed());
    }

    #[test]
    fn full_chunk_splits_before_exceeding_limit() {
        let config = ClientConfig {
            max_message_size: 64,
            ..ClientConfig::default()
        };
        let (connection, mut peer) = raw_peer(config);
        let mut sender = connection
            .sender(LogicalEndpoint::data("i", "t"), BytesCodec)
            .unwrap();

        // 31 bytes each with prefix; the chunk budget here is 49 bytes.
        sender.send(&Bytes::from(vec![1u8; 30])).unwrap();
        sender.send(&Bytes::from(vec![2u8; 30])).unwrap();
        sender.close().unwrap();

        let first = chunks(peer.read_message().unwrap());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload.len(), 31);
        let second = chunks(peer.read_message().unwrap());
        assert_eq!(second[0].payload.len(), 31);
        assert!(second[1].is_last);
    }
}
