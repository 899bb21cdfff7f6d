use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Crates whose events follow `--log-level`. Everything else is held at
/// warn unless `RUST_LOG` says otherwise.
const DATA_PLANE_CRATES: [&str; 4] = [
    "fndata",
    "fndata_client",
    "fndata_frame",
    "fndata_transport",
];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn directives(level: LogLevel) -> String {
    let others = match level {
        LogLevel::Error => "error",
        _ => "warn",
    };
    let mut directives = others.to_string();
    for krate in DATA_PLANE_CRATES {
        directives.push_str(&format!(",{krate}={}", level.as_str()));
    }
    directives
}

/// Install the stderr subscriber. Records go to stdout, logs never do.
///
/// Reader threads are named after their descriptor, so thread names are
/// included to tell connections apart.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(level)));
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_thread_names(true)
        .with_target(false);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}
