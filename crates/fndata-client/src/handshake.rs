use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use fndata_frame::{FrameError, Message, MessageReader, MessageWriter};
use serde::{Deserialize, Serialize};

use crate::error::{DataError, Result};

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_ID_LEN: usize = 128;

/// Sent by the connecting side in the first CONTROL message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Protocol name. Must be `fndata` by default.
    pub protocol: String,
    /// Protocol version string.
    pub version: String,
    /// Identifier of the connecting process.
    pub client_id: String,
}

/// Answer from the accepting side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Protocol name. Must match request protocol.
    pub protocol: String,
    /// Negotiated protocol version.
    pub version: String,
    /// Identifier the accepting side assigned to this connection.
    pub peer_id: String,
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Identifier of the remote side: the assigned peer id for the
    /// connecting side, the client id for the accepting side.
    pub peer_id: String,
    /// Negotiated protocol version.
    pub protocol_version: String,
}

/// Configuration for handshake negotiation.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Bound on the whole exchange.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version.
    pub protocol_version: String,
    /// Maximum handshake message size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "fndata".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 16 * 1024,
        }
    }
}

/// Perform the connecting side of the handshake.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    client_id: &str,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    let local = Greeting::local(config, "client_id", client_id)?;
    send_control_json(
        writer,
        &HandshakeRequest {
            protocol: local.protocol.to_string(),
            version: local.version.to_string(),
            client_id: local.id.to_string(),
        },
    )?;

    let payload = recv_control_payload(reader, Instant::now() + config.timeout, config)?;
    let resp: HandshakeResponse = serde_json::from_slice(&payload)?;
    let remote = Greeting::remote(&resp.protocol, &resp.version, "peer_id", &resp.peer_id)?;
    local.accept(&remote, local.version.serves(remote.version))?;

    Ok(HandshakeResult {
        peer_id: resp.peer_id,
        protocol_version: resp.version,
    })
}

/// Perform the accepting side of the handshake.
///
/// On rejection nothing is answered; the caller drops the stream and the
/// connecting side observes a disconnect.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    peer_id: &str,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    let local = Greeting::local(config, "peer_id", peer_id)?;

    let payload = recv_control_payload(reader, Instant::now() + config.timeout, config)?;
    let req: HandshakeRequest = serde_json::from_slice(&payload)?;
    let remote = Greeting::remote(&req.protocol, &req.version, "client_id", &req.client_id)?;
    local.accept(&remote, remote.version.serves(local.version))?;

    send_control_json(
        writer,
        &HandshakeResponse {
            protocol: local.protocol.to_string(),
            version: local.version.to_string(),
            peer_id: local.id.to_string(),
        },
    )?;

    Ok(HandshakeResult {
        peer_id: req.client_id,
        protocol_version: local.version.to_string(),
    })
}

/// `<major>.<minor>` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Version {
    major: u16,
    minor: u16,
}

impl Version {
    /// A client at `self` can talk to a server at `server`: same major, and
    /// the client knows at least the server's minor revision.
    fn serves(self, server: Version) -> bool {
        self.major == server.major && self.minor >= server.minor
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Validated identity of one side of the exchange.
struct Greeting<'a> {
    protocol: &'a str,
    version: Version,
    id: &'a str,
}

impl<'a> Greeting<'a> {
    fn local(config: &'a HandshakeConfig, id_field: &str, id: &'a str) -> Result<Self> {
        Self::remote(&config.protocol_name, &config.protocol_version, id_field, id)
    }

    fn remote(protocol: &'a str, version: &str, id_field: &str, id: &'a str) -> Result<Self> {
        check_len("protocol name", protocol, MAX_PROTOCOL_LEN)?;
        check_len("protocol version", version, MAX_VERSION_LEN)?;
        check_len(id_field, id, MAX_ID_LEN)?;
        Ok(Self {
            protocol,
            version: parse_version(version)?,
            id,
        })
    }

    fn accept(&self, remote: &Greeting<'_>, compatible: bool) -> Result<()> {
        if remote.protocol != self.protocol {
            return Err(DataError::HandshakeFailed(format!(
                "peer speaks '{}', expected '{}'",
                remote.protocol, self.protocol
            )));
        }
        if !compatible {
            return Err(DataError::HandshakeFailed(format!(
                "peer version {} is incompatible with local {}",
                remote.version, self.version
            )));
        }
        Ok(())
    }
}

fn send_control_json<T: Serialize, W: Write>(
    writer: &mut MessageWriter<W>,
    value: &T,
) -> Result<()> {
    writer.write_control(&serde_json::to_vec(value)?)?;
    Ok(())
}

/// Wait for the first CONTROL message, retrying read timeouts until `deadline`.
fn recv_control_payload<R: Read>(
    reader: &mut MessageReader<R>,
    deadline: Instant,
    config: &HandshakeConfig,
) -> Result<Vec<u8>> {
    while Instant::now() < deadline {
        match reader.read_message() {
            Ok(Message::Control(payload)) => return Ok(payload.to_vec()),
            Ok(Message::Elements(_)) => {
                return Err(DataError::HandshakeFailed(
                    "element data arrived before the handshake".to_string(),
                ));
            }
            Err(FrameError::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(FrameError::MessageTooLarge { size, max }) => {
                return Err(DataError::HandshakeFailed(format!(
                    "handshake message too large: {size} bytes (max {max})"
                )));
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(DataError::Disconnected(
                    "peer hung up during handshake".to_string(),
                ));
            }
            Err(err) => return Err(DataError::Frame(err)),
        }
    }
    Err(DataError::Timeout(config.timeout))
}

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.is_empty() || value.len() > max {
        return Err(DataError::HandshakeFailed(format!(
            "{field} must be 1..={max} bytes, got {}",
            value.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    Ok(parse_version(client_version)?.serves(parse_version(server_version)?))
}

fn parse_version(version: &str) -> Result<Version> {
    let invalid = |why: &str| DataError::HandshakeFailed(format!("invalid version '{version}': {why}"));

    let (major, minor) = version
        .split_once('.')
        .filter(|(_, minor)| !minor.contains('.'))
        .ok_or_else(|| invalid("expected '<major>.<minor>'"))?;
    Ok(Version {
        major: major.parse().map_err(|_| invalid("non-numeric major"))?,
        minor: minor.parse().map_err(|_| invalid("non-numeric minor"))?,
    })
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};
    use std::os::unix::net::UnixStream;
    use std::thread;

    use bytes::Bytes;
    use fndata_frame::{Chunk, FrameConfig, LogicalEndpoint};

    use super::*;

    fn split(stream: UnixStream) -> (MessageReader<UnixStream>, MessageWriter<UnixStream>) {
        let reader = MessageReader::new(stream.try_clone().unwrap());
        (reader, MessageWriter::new(stream))
    }

    #[test]
    fn successful_handshake() {
        let (left, right) = UnixStream::pair().unwrap();

        let server = thread::spawn(move || {
            let (mut reader, mut writer) = split(left);
            handshake_server(&mut reader, &mut writer, "peer-1", &HandshakeConfig::default())
                .unwrap()
        });

        let (mut reader, mut writer) = split(right);
        let client_result =
            handshake_client(&mut reader, &mut writer, "sdk-7", &HandshakeConfig::default())
                .unwrap();
        let server_result = server.join().unwrap();

        assert_eq!(client_result.peer_id, "peer-1");
        assert_eq!(client_result.protocol_version, "1.0");
        assert_eq!(server_result.peer_id, "sdk-7");
    }

    #[test]
    fn newer_client_minor_is_accepted() {
        let (left, right) = UnixStream::pair().unwrap();

        let server = thread::spawn(move || {
            let (mut reader, mut writer) = split(left);
            handshake_server(&mut reader, &mut writer, "peer-2", &HandshakeConfig::default())
        });

        let (mut reader, mut writer) = split(right);
        let cfg = HandshakeConfig {
            protocol_version: "1.3".to_string(),
            ..HandshakeConfig::default()
        };
        let client = handshake_client(&mut reader, &mut writer, "sdk", &cfg).unwrap();
        assert_eq!(client.protocol_version, "1.0");
        assert!(server.join().unwrap().is_ok());
    }

    #[test]
    fn version_mismatch() {
        let (left, right) = UnixStream::pair().unwrap();

        let server = thread::spawn(move || {
            let (mut reader, mut writer) = split(left);
            handshake_server(&mut reader, &mut writer, "peer-3", &HandshakeConfig::default())
        });

        let (mut reader, mut writer) = split(right);
        let cfg = HandshakeConfig {
            protocol_version: "2.0".to_string(),
            ..HandshakeConfig::default()
        };
        let client = handshake_client(&mut reader, &mut writer, "sdk", &cfg);
        let server = server.join().unwrap();

        assert!(matches!(server, Err(DataError::HandshakeFailed(_))));
        assert!(matches!(client, Err(DataError::Disconnected(_))));
    }

    #[test]
    fn wrong_protocol_name_rejected() {
        let (left, right) = UnixStream::pair().unwrap();

        let server = thread::spawn(move || {
            let (mut reader, mut writer) = split(left);
            handshake_server(&mut reader, &mut writer, "peer-4", &HandshakeConfig::default())
        });

        let (mut reader, mut writer) = split(right);
        let cfg = HandshakeConfig {
            protocol_name: "foobar".to_string(),
            ..HandshakeConfig::default()
        };
        let client = handshake_client(&mut reader, &mut writer, "sdk", &cfg);

        assert!(matches!(client, Err(DataError::Disconnected(_))));
        assert!(matches!(
            server.join().unwrap(),
            Err(DataError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn invalid_json_rejected() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut raw_writer = MessageWriter::new(left);
        raw_writer.write_control(b"{not-json").unwrap();

        let (mut reader, mut writer) = split(right);
        let result =
            handshake_server(&mut reader, &mut writer, "peer-5", &HandshakeConfig::default());
        assert!(matches!(result, Err(DataError::Json(_))));
    }

    #[test]
    fn elements_before_handshake_rejected() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut raw_writer = MessageWriter::new(left);
        raw_writer
            .write_elements(&[Chunk::data(
                LogicalEndpoint::data("i", "t"),
                Bytes::from_static(b"early"),
            )])
            .unwrap();

        let (mut reader, mut writer) = split(right);
        let result =
            handshake_server(&mut reader, &mut writer, "peer-6", &HandshakeConfig::default());
        assert!(matches!(result, Err(DataError::HandshakeFailed(_))));
    }

    #[test]
    fn oversized_handshake_rejected() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut raw_writer = MessageWriter::new(left);
        raw_writer.write_control(&vec![b' '; 4096]).unwrap();

        let right_reader = right.try_clone().unwrap();
        let mut reader = MessageReader::with_config(
            right_reader,
            FrameConfig {
                max_message_size: 1024,
                ..FrameConfig::default()
            },
        );
        let mut writer = MessageWriter::new(right);
        let result =
            handshake_server(&mut reader, &mut writer, "peer-7", &HandshakeConfig::default());
        assert!(matches!(result, Err(DataError::HandshakeFailed(msg)) if msg.contains("too large")));
    }

    #[test]
    fn handshake_timeout() {
        let mut reader = MessageReader::new(AlwaysTimedOutReader);
        let mut writer = MessageWriter::new(Cursor::new(Vec::<u8>::new()));
        let cfg = HandshakeConfig {
            timeout: Duration::from_millis(25),
            ..HandshakeConfig::default()
        };

        let result = handshake_client(&mut reader, &mut writer, "sdk", &cfg);
        assert!(matches!(result, Err(DataError::Timeout(_))));
    }

    #[test]
    fn invalid_local_settings_fail_before_io() {
        let mut reader = MessageReader::new(Cursor::new(Vec::<u8>::new()));
        let mut writer = MessageWriter::new(Cursor::new(Vec::<u8>::new()));

        let bad_version = HandshakeConfig {
            protocol_version: "one".to_string(),
            ..HandshakeConfig::default()
        };
        assert!(matches!(
            handshake_client(&mut reader, &mut writer, "sdk", &bad_version),
            Err(DataError::HandshakeFailed(_))
        ));
        assert!(matches!(
            handshake_client(&mut reader, &mut writer, "", &HandshakeConfig::default()),
            Err(DataError::HandshakeFailed(_))
        ));
        assert!(writer.into_inner().into_inner().is_empty());
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("1.0").unwrap(), Version { major: 1, minor: 0 });
        assert_eq!(parse_version("12.34").unwrap().to_string(), "12.34");
        assert!(parse_version("1").is_err());
        assert!(parse_version("1.2.3").is_err());
        assert!(parse_version("a.1").is_err());
        assert!(is_version_compatible("1.2", "1.1").unwrap());
        assert!(!is_version_compatible("1.0", "1.1").unwrap());
        assert!(!is_version_compatible("2.0", "1.0").unwrap());
    }

    struct AlwaysTimedOutReader;

    impl Read for AlwaysTimedOutReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::TimedOut))
        }
    }
}
