use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use fndata_client::{ClientConfig, LogicalEndpoint};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod info;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept one connection and print the records of one instruction.
    Listen(ListenArgs),
    /// Send records on one logical endpoint and end the stream.
    Send(SendArgs),
    /// Connect, handshake and print the negotiated metadata.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Listen(args) => listen::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Info(args) => info::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct EndpointArgs {
    /// Instruction id the streams belong to.
    #[arg(long, short = 'i')]
    pub instruction: String,
    /// Transform id of the endpoint.
    #[arg(long, short = 't')]
    pub transform: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Descriptor to bind (unix:///path.sock, /path.sock, tcp://host:port).
    pub descriptor: String,
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Also expect timer streams for these families (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub timer_family: Vec<String>,
    /// Give up if the streams have not ended within this time (e.g. 30s, 500ms).
    #[arg(long, default_value = "30s")]
    pub timeout: String,
    /// Prefix for the peer ids handed out during the handshake.
    #[arg(long, env = "FNDATA_CLIENT_ID")]
    pub client_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Descriptor to connect to.
    pub descriptor: String,
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Send on the timer stream of this family instead of the data stream.
    #[arg(long)]
    pub timer_family: Option<String>,
    /// Records to send (comma-separated).
    #[arg(long, value_delimiter = ',', conflicts_with = "file")]
    pub data: Vec<String>,
    /// Read records from a file, one per line.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Buffered bytes that trigger a chunk write.
    #[arg(long)]
    pub flush_threshold: Option<usize>,
    /// Connection establishment timeout (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s")]
    pub connect_timeout: String,
    /// Client id announced during the handshake.
    #[arg(long, env = "FNDATA_CLIENT_ID")]
    pub client_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Descriptor to connect to.
    pub descriptor: String,
    /// Time allowed for the service to come up and answer (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Client id announced during the handshake.
    #[arg(long, env = "FNDATA_CLIENT_ID")]
    pub client_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn client_config(client_id: Option<&str>) -> ClientConfig {
    let mut config = ClientConfig::default();
    if let Some(id) = client_id {
        config.client_id = id.to_string();
    }
    config
}

pub(crate) fn data_endpoint(args: &EndpointArgs) -> LogicalEndpoint {
    LogicalEndpoint::data(args.instruction.as_str(), args.transform.as_str())
}

pub(crate) fn timer_endpoint(args: &EndpointArgs, family: &str) -> LogicalEndpoint {
    LogicalEndpoint::timer(args.instruction.as_str(), args.transform.as_str(), family)
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
