use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use framelink_frame::{AcquiredFrame, Backend, FramePayload};
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
struct FrameOutput<'a> {
    schema_id: &'a str,
    backend: &'a str,
    sequence: u64,
    timestamp_us: u64,
    width: u32,
    height: u32,
    channels: u32,
    payload_size: u64,
    location: &'a str,
    digest: String,
}

pub fn print_frame(frame: &AcquiredFrame<'_>, backend: Backend, format: OutputFormat) {
    let header = &frame.header;
    match format {
        OutputFormat::Json => {
            let out = FrameOutput {
                schema_id: "https://schemas.3leaps.dev/framelink/cli/v1/frame-acquired.schema.json",
                backend: backend.as_str(),
                sequence: header.sequence_number,
                timestamp_us: header.timestamp_us,
                width: header.width,
                height: header.height,
                channels: header.channels,
                payload_size: header.payload_size,
                location: location(&frame.payload),
                digest: digest(&frame.payload),
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
                .set_header(vec!["SEQ", "SIZE", "DIMS", "TIMESTAMP_US", "BACKEND", "DIGEST"])
                .add_row(vec![
                    header.sequence_number.to_string(),
                    header.payload_size.to_string(),
                    dims(frame),
                    header.timestamp_us.to_string(),
                    backend.to_string(),
                    digest(&frame.payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "seq={} dims={} size={} ts={}us backend={} digest={}",
                header.sequence_number,
                dims(frame),
                header.payload_size,
                header.timestamp_us,
                backend,
                digest(&frame.payload)
            );
        }
        OutputFormat::Raw => {
            if let Some(bytes) = frame.payload.as_host() {
                print_raw(bytes);
            }
        }
    }
}

/// Print any serializable report in the selected format.
///
/// Table and pretty output fall back to indented JSON for reports without
/// a dedicated layout.
pub fn print_report<T: Serialize>(report: &T, format: OutputFormat) {
    let rendered = match format {
        OutputFormat::Json | OutputFormat::Raw => serde_json::to_string(report),
        OutputFormat::Table | OutputFormat::Pretty => serde_json::to_string_pretty(report),
    };
    println!("{}", rendered.unwrap_or_else(|_| "{}".to_string()));
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn dims(frame: &AcquiredFrame<'_>) -> String {
    format!(
        "{}x{}x{}",
        frame.header.width, frame.header.height, frame.header.channels
    )
}

fn location(payload: &FramePayload<'_>) -> &'static str {
    match payload {
        FramePayload::Host(_) => "host",
        FramePayload::Device(_) => "device",
    }
}

/// FNV-1a of host bytes, or the device address for device frames.
fn digest(payload: &FramePayload<'_>) -> String {
    match payload {
        FramePayload::Host(bytes) => format!("{:016x}", fnv1a(bytes)),
        FramePayload::Device(buffer) => {
            format!("device{}:{:#x}", buffer.device_ordinal, buffer.ptr)
        }
    }
}

pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
