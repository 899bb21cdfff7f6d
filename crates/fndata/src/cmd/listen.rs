use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fndata_client::{DataListener, Inbound, LogicalEndpoint, ServiceDescriptor, Utf8Codec};
use tracing::{info, warn};

use crate::cmd::{client_config, data_endpoint, parse_duration, timer_endpoint, ListenArgs};
use crate::exit::{data_error, inbound_error, CliError, CliResult, INTERNAL, SUCCESS, TIMEOUT};
use crate::output::{print_record, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let descriptor = ServiceDescriptor::new(args.descriptor.as_str());
    let listener = DataListener::bind_with_config(&descriptor, client_config(args.client_id.as_deref()))
        .map_err(|err| data_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let instruction_id = args.endpoint.instruction.clone();
    let endpoints = expected_endpoints(&args);
    let (connection, completion) = listener
        .accept_with(|connection| {
            let peer_id = connection.peer_id().to_string();
            let inbound = endpoints.iter().fold(Inbound::new(), |inbound, endpoint| {
                let tag = endpoint.clone();
                let peer_id = peer_id.clone();
                inbound.on_records(endpoint.clone(), Utf8Codec, move |record: String| {
                    print_record(&tag, &record, &peer_id, format);
                    Ok(())
                })
            });
            connection.register_receiver(&instruction_id, inbound)
        })
        .map_err(|err| data_error("accept failed", err))?;

    let deadline = Instant::now() + timeout;
    let outcome = loop {
        if let Some(outcome) = completion.wait_timeout(POLL_INTERVAL) {
            break Some(outcome);
        }
        if !running.load(Ordering::SeqCst) || Instant::now() >= deadline {
            break None;
        }
    };

    let result = match outcome {
        Some(Ok(())) => connection
            .unregister_receiver(&instruction_id)
            .map(|()| SUCCESS)
            .map_err(|err| data_error("unregister failed", err)),
        Some(Err(err)) => Err(inbound_error("stream failed", err)),
        None if !running.load(Ordering::SeqCst) => {
            info!(instruction_id = %instruction_id, "interrupted; closing connection");
            Ok(SUCCESS)
        }
        None => {
            warn!(instruction_id = %instruction_id, ?timeout, "streams did not end in time");
            Err(CliError::new(
                TIMEOUT,
                format!("streams for {instruction_id} did not end within {timeout:?}"),
            ))
        }
    };
    connection.close();
    result
}

fn expected_endpoints(args: &ListenArgs) -> Vec<LogicalEndpoint> {
    let mut endpoints = vec![data_endpoint(&args.endpoint)];
    endpoints.extend(
        args.timer_family
            .iter()
            .map(|family| timer_endpoint(&args.endpoint, family)),
    );
    endpoints
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
