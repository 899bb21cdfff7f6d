use std::sync::Arc;
use std::time::{Duration, Instant};

use fndata_client::{Connection, DataClient, DataError, HandshakeConfig, ServiceDescriptor};
use fndata_transport::TransportError;
use serde::Serialize;

use crate::cmd::{client_config, parse_duration, InfoArgs};
use crate::exit::{data_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct InfoOutput {
    descriptor: String,
    peer_id: String,
    client_id: String,
    protocol_version: String,
    connected: bool,
}

pub fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let mut config = client_config(args.client_id.as_deref());
    config.connect_timeout = timeout;
    config.handshake = HandshakeConfig {
        timeout,
        ..HandshakeConfig::default()
    };
    let client = DataClient::new(config);
    let descriptor = ServiceDescriptor::new(args.descriptor.as_str());

    let connection = connect_with_retry(&client, &descriptor, timeout)?;
    let out = InfoOutput {
        descriptor: descriptor.url().to_string(),
        peer_id: connection.peer_id().to_string(),
        client_id: client.config().client_id.clone(),
        protocol_version: connection.protocol_version().to_string(),
        connected: !connection.is_closed(),
    };
    print_info(&out, format);
    client.shutdown();
    Ok(SUCCESS)
}

/// Keep trying while the service is not up yet, until `timeout` elapses.
fn connect_with_retry(
    client: &DataClient,
    descriptor: &ServiceDescriptor,
    timeout: Duration,
) -> CliResult<Arc<Connection>> {
    let start = Instant::now();
    loop {
        match client.connection(descriptor) {
            Ok(connection) => return Ok(connection),
            Err(err) => {
                if !is_retryable_connect_error(&err) {
                    return Err(data_error("connect failed", err));
                }
                if start.elapsed() >= timeout {
                    return Err(CliError::new(
                        TIMEOUT,
                        format!("connect timed out after {timeout:?}"),
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn is_retryable_connect_error(err: &DataError) -> bool {
    match err {
        DataError::Connect { source, .. } => match source.as_ref() {
            DataError::Transport(TransportError::Connect { source, .. }) => matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ),
            _ => false,
        },
        _ => false,
    }
}

fn print_info(out: &InfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Connection Info:");
            println!("  Descriptor:       {}", out.descriptor);
            println!("  Peer ID:          {}", out.peer_id);
            println!("  Client ID:        {}", out.client_id);
            println!("  Protocol:         fndata {}", out.protocol_version);
        }
        OutputFormat::Raw => {
            println!("{}", out.peer_id);
        }
    }
}
