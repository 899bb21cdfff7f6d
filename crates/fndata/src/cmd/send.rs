use std::fs;

use fndata_client::{DataClient, ServiceDescriptor, Utf8Codec};

use crate::cmd::{client_config, data_endpoint, parse_duration, timer_endpoint, SendArgs};
use crate::exit::{data_error, io_error, CliResult, SUCCESS};
use crate::output::{print_summary, OutputFormat, SendSummary};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let records = resolve_records(&args)?;
    let mut config = client_config(args.client_id.as_deref());
    config.connect_timeout = parse_duration(&args.connect_timeout)?;
    if let Some(threshold) = args.flush_threshold {
        config.flush_threshold = threshold;
    }

    let endpoint = match &args.timer_family {
        Some(family) => timer_endpoint(&args.endpoint, family),
        None => data_endpoint(&args.endpoint),
    };
    let descriptor = ServiceDescriptor::new(args.descriptor.as_str());
    let client = DataClient::new(config);

    let connection = client
        .connection(&descriptor)
        .map_err(|err| data_error("connect failed", err))?;
    let mut sender = connection
        .sender(endpoint.clone(), Utf8Codec)
        .map_err(|err| data_error("send failed", err))?;
    for record in &records {
        sender
            .send(record)
            .map_err(|err| data_error("send failed", err))?;
    }
    sender
        .close()
        .map_err(|err| data_error("close failed", err))?;

    print_summary(
        &SendSummary {
            descriptor: descriptor.url(),
            endpoint: endpoint.to_string(),
            records: sender.records_sent(),
            bytes: sender.bytes_sent(),
            peer_id: connection.peer_id(),
        },
        format,
    );
    client.shutdown();
    Ok(SUCCESS)
}

fn resolve_records(args: &SendArgs) -> CliResult<Vec<String>> {
    if let Some(path) = &args.file {
        let text = fs::read_to_string(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        return Ok(text.lines().map(str::to_string).collect());
    }
    Ok(args.data.clone())
}
