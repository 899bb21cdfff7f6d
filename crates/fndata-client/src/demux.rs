//! The per-connection reader loop: reads messages and routes each chunk to
//! the receiver registered for its instruction.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use fndata_frame::{Chunk, FrameError, Message, MessageReader};
use fndata_transport::DataStream;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionShared;
use crate::registry::Dispatch;

pub(crate) fn spawn_reader(
    shared: Arc<ConnectionShared>,
    reader: MessageReader<DataStream>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("fndata-reader-{}", shared.descriptor()))
        .spawn(move || run(&shared, reader))
}

fn run(shared: &ConnectionShared, mut reader: MessageReader<DataStream>) {
    debug!(descriptor = %shared.descriptor(), "reader loop started");

    let reason = loop {
        match reader.read_message() {
            Ok(Message::Elements(chunks)) => {
                for chunk in &chunks {
                    route(shared, chunk);
                }
            }
            Ok(Message::Control(payload)) => {
                debug!(
                    descriptor = %shared.descriptor(),
                    len = payload.len(),
                    "ignoring control message after handshake"
                );
            }
            Err(FrameError::ConnectionClosed) => break "peer closed the connection".to_string(),
            Err(err) => {
                if !shared.is_closed() {
                    warn!(descriptor = %shared.descriptor(), error = %err, "reader loop failed");
                }
                break err.to_string();
            }
        }
    };

    if shared.fail(&reason) {
        debug!(descriptor = %shared.descriptor(), reason, "reader loop terminated connection");
    }
    debug!(descriptor = %shared.descriptor(), "reader loop stopped");
}

/// Hand one chunk to its instruction's receiver.
pub(crate) fn route(shared: &ConnectionShared, chunk: &Chunk) {
    let instruction_id = chunk.endpoint.instruction_id();
    let entry = {
        let mut registry = shared.lock_registry();
        match registry.get(instruction_id) {
            Some(entry) => entry,
            None => {
                let retired = registry.retired_kind(instruction_id);
                drop(registry);
                match retired {
                    Some(kind) => debug!(
                        descriptor = %shared.descriptor(),
                        endpoint = %chunk.endpoint,
                        retired = ?kind,
                        "dropping chunk for retired instruction"
                    ),
                    None => warn!(
                        descriptor = %shared.descriptor(),
                        endpoint = %chunk.endpoint,
                        bytes = chunk.payload.len(),
                        "dropping chunk for unknown instruction"
                    ),
                }
                return;
            }
        }
    };

    let outcome = entry.dispatch(chunk);
    match outcome {
        Dispatch::Delivered => {
            trace!(endpoint = %chunk.endpoint, bytes = chunk.payload.len(), "delivered chunk");
        }
        Dispatch::EndpointComplete => {
            debug!(endpoint = %chunk.endpoint, "inbound stream ended");
        }
        Dispatch::Completed => {
            debug!(instruction_id, "all inbound streams ended");
        }
        Dispatch::Failed(err) => {
            warn!(
                descriptor = %shared.descriptor(),
                endpoint = %chunk.endpoint,
                error = %err,
                "inbound receiver failed"
            );
            shared.lock_registry().retire_failed(instruction_id, &entry);
        }
        Dispatch::Discarded(reason) => {
            debug!(endpoint = %chunk.endpoint, reason, "discarding chunk");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::{Bytes, BytesMut};
    use fndata_frame::{LogicalEndpoint, MessageWriter};

    use super::*;
    use crate::codec::{Codec, Utf8Codec};
    use crate::config::ClientConfig;
    use crate::connection::test_support::from_stream;
    use crate::error::{DataError, InboundError};
    use crate::receiver::Inbound;

    const WAIT: Duration = Duration::from_secs(5);

    fn payload(records: &[&str]) -> Bytes {
        let mut buf = BytesMut::new();
        for record in records {
            Utf8Codec.encode(&record.to_string(), &mut buf).unwrap();
        }
        buf.freeze()
    }

    fn recorder(endpoint: &LogicalEndpoint) -> (Inbound, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let inbound = Inbound::new().on_records(endpoint.clone(), Utf8Codec, move |record: String| {
            sink.lock().unwrap().push(record);
            Ok(())
        });
        (inbound, seen)
    }

    /// A started connection plus a raw writer standing in for the peer.
    fn raw_peer() -> (crate::connection::Connection, MessageWriter<DataStream>) {
        let (local, remote) = DataStream::pair().unwrap();
        let connection = from_stream(local, "demux", &ClientConfig::default());
        (connection, MessageWriter::new(remote))
    }

    #[test]
    fn unknown_instruction_is_dropped_and_loop_continues() {
        let (connection, mut peer) = raw_peer();
        let known = LogicalEndpoint::data("known", "t");
        let (inbound, seen) = recorder(&known);
        let completion = connection.register_receiver("known", inbound).unwrap();

        let mut last = Chunk::data(known.clone(), payload(&["kept"]));
        last.is_last = true;
        peer.write_elements(&[
            Chunk::data(LogicalEndpoint::data("ghost", "t"), payload(&["lost"])),
            last,
        ])
        .unwrap();

        assert_eq!(completion.wait_timeout(WAIT), Some(Ok(())));
        assert_eq!(*seen.lock().unwrap(), vec!["kept"]);
        assert!(!connection.is_closed());
    }

    #[test]
    fn decode_error_isolated_to_one_instruction() {
        let (connection, mut peer) = raw_peer();
        let bad = LogicalEndpoint::data("bad", "t");
        let good = LogicalEndpoint::data("good", "t");
        let (bad_inbound, bad_seen) = recorder(&bad);
        let (good_inbound, good_seen) = recorder(&good);
        let bad_done = connection.register_receiver("bad", bad_inbound).unwrap();
        let good_done = connection.register_receiver("good", good_inbound).unwrap();

        peer.write_elements(&[
            Chunk::data(bad.clone(), Bytes::from_static(&[9, b'x'])),
            Chunk::data(good.clone(), payload(&["1"])),
            Chunk::data(bad.clone(), payload(&["after"])),
            Chunk::data(good.clone(), payload(&["2"])),
            Chunk::last(good.clone()),
        ])
        .unwrap();

        assert_eq!(good_done.wait_timeout(WAIT), Some(Ok(())));
        assert!(matches!(
            bad_done.wait_timeout(WAIT),
            Some(Err(InboundError::Decode { .. }))
        ));
        assert!(bad_seen.lock().unwrap().is_empty());
        assert_eq!(*good_seen.lock().unwrap(), vec!["1", "2"]);

        // Removed by the reader loop; unregister is a no-op once.
        assert_eq!(connection.active_receivers(), 1);
        connection.unregister_receiver("bad").unwrap();
        assert!(matches!(
            connection.unregister_receiver("bad"),
            Err(DataError::NotFound { .. })
        ));
    }

    #[test]
    fn malformed_message_closes_connection() {
        let (connection, peer) = raw_peer();
        let endpoint = LogicalEndpoint::data("x", "t");
        let (inbound, _) = recorder(&endpoint);
        let completion = connection.register_receiver("x", inbound).unwrap();

        let mut stream = peer.into_inner();
        std::io::Write::write_all(&mut stream, b"XX\x00\x00\x00\x00\x01\x01").unwrap();

        assert!(matches!(
            completion.wait_timeout(WAIT),
            Some(Err(InboundError::ConnectionClosed { .. }))
        ));
        assert!(connection.is_closed());
        assert!(connection.close_reason().unwrap().contains("magic"));
    }

    #[test]
    fn write_failure_inside_callback_fails_receivers() {
        let (local, remote) = DataStream::pair().unwrap();
        let socket = local.try_clone().unwrap();
        let connection = from_stream(local, "demux", &ClientConfig::default());
        let mut peer = MessageWriter::new(remote);

        let input = LogicalEndpoint::data("w", "in");
        let mut reply = connection
            .sender(LogicalEndpoint::data("w", "out"), Utf8Codec)
            .unwrap();
        let write_errors = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::clone(&write_errors);
        let inbound = Inbound::new().on_records(input.clone(), Utf8Codec, move |record: String| {
            socket.shutdown()?;
            let result = reply.send(&record).and_then(|()| reply.flush());
            if let Err(err) = &result {
                errors.lock().unwrap().push(err.is_connection_error());
            }
            result?;
            Ok(())
        });
        let done = connection.register_receiver("w", inbound).unwrap();
        let (bystander, _) = recorder(&LogicalEndpoint::data("b", "t"));
        let bystander_done = connection.register_receiver("b", bystander).unwrap();

        peer.write_elements(&[Chunk::data(input, payload(&["x"]))]).unwrap();

        assert!(matches!(
            done.wait_timeout(WAIT),
            Some(Err(InboundError::ConnectionClosed { .. }))
        ));
        assert!(matches!(
            bystander_done.wait_timeout(WAIT),
            Some(Err(InboundError::ConnectionClosed { .. }))
        ));
        assert_eq!(*write_errors.lock().unwrap(), vec![true]);
        assert!(connection.close_reason().unwrap().starts_with("write failed"));
        connection.close();
    }

    #[test]
    fn control_message_after_handshake_is_ignored() {
        let (connection, mut peer) = raw_peer();
        let endpoint = LogicalEndpoint::data("x", "t");
        let (inbound, seen) = recorder(&endpoint);
        let completion = connection.register_receiver("x", inbound).unwrap();

        peer.write_control(b"{\"ping\":true}").unwrap();
        let mut last = Chunk::data(endpoint, payload(&["v"]));
        last.is_last = true;
        peer.write_elements(&[last]).unwrap();

        assert_eq!(completion.wait_timeout(WAIT), Some(Ok(())));
        assert_eq!(*seen.lock().unwrap(), vec!["v"]);
    }
}
