//! Inbound consumers: what happens to the payload of each arriving chunk.

use std::collections::HashMap;
use std::fmt;

use fndata_frame::LogicalEndpoint;

use crate::codec::Codec;
use crate::error::InboundError;

/// Error type receiver callbacks may return.
pub type ReceiveError = Box<dyn std::error::Error + Send + Sync>;

/// Consumes the payloads of one logical endpoint's chunks, in arrival order.
///
/// Consumers run on the connection's reader thread. They must not block
/// indefinitely, or every other stream on that connection stalls.
pub trait ChunkConsumer: Send {
    fn consume(&mut self, endpoint: &LogicalEndpoint, payload: &[u8]) -> Result<(), InboundError>;
}

/// Decodes every record in a payload, then hands them to the callback one
/// at a time. A decode failure delivers nothing from that payload.
struct DecodingConsumer<C, F> {
    codec: C,
    callback: F,
}

impl<C, F> ChunkConsumer for DecodingConsumer<C, F>
where
    C: Codec,
    F: FnMut(C::Record) -> Result<(), ReceiveError> + Send,
{
    fn consume(&mut self, endpoint: &LogicalEndpoint, payload: &[u8]) -> Result<(), InboundError> {
        let records = self
            .codec
            .decode(payload)
            .map_err(|err| InboundError::Decode {
                endpoint: endpoint.clone(),
                message: err.to_string(),
            })?;

        for record in records {
            (self.callback)(record).map_err(|err| InboundError::Receiver {
                endpoint: endpoint.clone(),
                message: err.to_string(),
            })?;
        }
        Ok(())
    }
}

struct RawConsumer<F> {
    callback: F,
}

impl<F> ChunkConsumer for RawConsumer<F>
where
    F: FnMut(&[u8]) -> Result<(), ReceiveError> + Send,
{
    fn consume(&mut self, endpoint: &LogicalEndpoint, payload: &[u8]) -> Result<(), InboundError> {
        (self.callback)(payload).map_err(|err| InboundError::Receiver {
            endpoint: endpoint.clone(),
            message: err.to_string(),
        })
    }
}

/// The set of endpoints an instruction expects data on, with one consumer
/// each. Registering the same endpoint twice keeps the later consumer.
#[derive(Default)]
pub struct Inbound {
    consumers: HashMap<LogicalEndpoint, Box<dyn ChunkConsumer>>,
}

impl Inbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `endpoint`'s payloads with `codec` and pass each record to
    /// `callback`.
    pub fn on_records<C, F>(self, endpoint: LogicalEndpoint, codec: C, callback: F) -> Self
    where
        C: Codec,
        F: FnMut(C::Record) -> Result<(), ReceiveError> + Send + 'static,
    {
        self.on_consumer(endpoint, Box::new(DecodingConsumer { codec, callback }))
    }

    /// Pass `endpoint`'s payloads to `callback` undecoded.
    pub fn on_chunks<F>(self, endpoint: LogicalEndpoint, callback: F) -> Self
    where
        F: FnMut(&[u8]) -> Result<(), ReceiveError> + Send + 'static,
    {
        self.on_consumer(endpoint, Box::new(RawConsumer { callback }))
    }

    pub fn on_consumer(mut self, endpoint: LogicalEndpoint, consumer: Box<dyn ChunkConsumer>) -> Self {
        self.consumers.insert(endpoint, consumer);
        self
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &LogicalEndpoint> {
        self.consumers.keys()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub(crate) fn into_consumers(self) -> HashMap<LogicalEndpoint, Box<dyn ChunkConsumer>> {
        self.consumers
    }
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("endpoints", &self.consumers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::BytesMut;

    use super::*;
    use crate::codec::Utf8Codec;

    fn encode(records: &[&str]) -> BytesMut {
        let mut buf = BytesMut::new();
        for record in records {
            Utf8Codec.encode(&record.to_string(), &mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn decoding_consumer_delivers_records_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let endpoint = LogicalEndpoint::data("i", "t");
        let mut consumers = Inbound::new()
            .on_records(endpoint.clone(), Utf8Codec, move |record| {
                sink.lock().unwrap().push(record);
                Ok(())
            })
            .into_consumers();

        let consumer = consumers.get_mut(&endpoint).unwrap();
        consumer.consume(&endpoint, &encode(&["a", "b"])).unwrap();
        consumer.consume(&endpoint, &encode(&["c"])).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn callback_error_stops_the_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let endpoint = LogicalEndpoint::data("i", "t");
        let mut consumers = Inbound::new()
            .on_records(endpoint.clone(), Utf8Codec, move |record: String| {
                if record == "bad" {
                    return Err("rejected".into());
                }
                sink.lock().unwrap().push(record);
                Ok(())
            })
            .into_consumers();

        let consumer = consumers.get_mut(&endpoint).unwrap();
        let err = consumer
            .consume(&endpoint, &encode(&["ok", "bad", "never"]))
            .unwrap_err();

        assert!(matches!(err, InboundError::Receiver { ref message, .. } if message == "rejected"));
        assert_eq!(*seen.lock().unwrap(), vec!["ok"]);
    }

    #[test]
    fn decode_error_delivers_nothing() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let endpoint = LogicalEndpoint::data("i", "t");
        let mut consumers = Inbound::new()
            .on_records(endpoint.clone(), Utf8Codec, move |_record| {
                *counter.lock().unwrap() += 1;
                Ok(())
            })
            .into_consumers();

        let mut payload = encode(&["fine"]);
        payload.extend_from_slice(&[5, b'x']);
        let err = consumers
            .get_mut(&endpoint)
            .unwrap()
            .consume(&endpoint, &payload)
            .unwrap_err();

        assert!(matches!(err, InboundError::Decode { .. }));
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn raw_consumer_sees_payload_bytes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let endpoint = LogicalEndpoint::timer("i", "t", "fam");
        let inbound = Inbound::new().on_chunks(endpoint.clone(), move |payload| {
            sink.lock().unwrap().extend_from_slice(payload);
            Ok(())
        });
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound.endpoints().next(), Some(&endpoint));

        let mut consumers = inbound.into_consumers();
        consumers
            .get_mut(&endpoint)
            .unwrap()
            .consume(&endpoint, b"\x01\x02")
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
