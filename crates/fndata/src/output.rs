use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use fndata_client::LogicalEndpoint;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct RecordOutput<'a> {
    instruction_id: &'a str,
    transform_id: &'a str,
    timer_family_id: Option<&'a str>,
    record: &'a str,
    size: usize,
    peer_id: &'a str,
    timestamp: String,
}

pub fn print_record(endpoint: &LogicalEndpoint, record: &str, peer_id: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = RecordOutput {
                instruction_id: endpoint.instruction_id(),
                transform_id: endpoint.transform_id(),
                timer_family_id: endpoint.timer_family_id(),
                record,
                size: record.len(),
                peer_id,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ENDPOINT", "SIZE", "PEER", "RECORD"])
                .add_row(vec![
                    endpoint.to_string(),
                    record.len().to_string(),
                    peer_id.to_string(),
                    record.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "endpoint={} size={} peer={} record={}",
                endpoint,
                record.len(),
                peer_id,
                record
            );
        }
        OutputFormat::Raw => {
            print_raw(record.as_bytes());
            print_raw(b"\n");
        }
    }
}

#[derive(Serialize)]
pub struct SendSummary<'a> {
    pub descriptor: &'a str,
    pub endpoint: String,
    pub records: u64,
    pub bytes: u64,
    pub peer_id: &'a str,
}

pub fn print_summary(summary: &SendSummary<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(summary).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["DESCRIPTOR", "ENDPOINT", "RECORDS", "BYTES"])
                .add_row(vec![
                    summary.descriptor.to_string(),
                    summary.endpoint.clone(),
                    summary.records.to_string(),
                    summary.bytes.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "sent {} records ({} bytes) on {} to {}",
                summary.records, summary.bytes, summary.endpoint, summary.descriptor
            );
        }
        OutputFormat::Raw => {}
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
