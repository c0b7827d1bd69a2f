use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use framelink_shm::{ControlRegion, ControlSnapshot};
use serde::Serialize;

use crate::cmd::{InspectArgs, Side};
use crate::exit::{channel_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct SlotInfo {
    index: usize,
    state: &'static str,
    sequence: u64,
    width: u32,
    height: u32,
    channels: u32,
    payload_size: u64,
}

#[derive(Serialize)]
struct InspectOutput {
    schema_id: &'static str,
    name: String,
    backing: &'static str,
    max_width: u32,
    max_height: u32,
    max_channels: u32,
    owner_pid: i32,
    owner_alive: bool,
    closed: bool,
    region_size: u64,
    last_sequence: u64,
    latest_ready: Option<usize>,
    slots: Vec<SlotInfo>,
}

impl From<ControlSnapshot> for InspectOutput {
    fn from(snapshot: ControlSnapshot) -> Self {
        let slots = snapshot
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotInfo {
                index,
                state: slot.state.as_str(),
                sequence: slot.header.sequence_number,
                width: slot.header.width,
                height: slot.header.height,
                channels: slot.header.channels,
                payload_size: slot.header.payload_size,
            })
            .collect();
        Self {
            schema_id: "https://schemas.3leaps.dev/framelink/cli/v1/channel-state.schema.json",
            name: snapshot.name,
            backing: snapshot.backing.as_str(),
            max_width: snapshot.limits.max_width,
            max_height: snapshot.limits.max_height,
            max_channels: snapshot.limits.max_channels,
            owner_pid: snapshot.owner_pid,
            owner_alive: snapshot.owner_alive,
            closed: snapshot.closed,
            region_size: snapshot.region_size,
            last_sequence: snapshot.last_sequence,
            latest_ready: snapshot.latest_ready,
            slots,
        }
    }
}

pub fn run(args: InspectArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.channel.resolve(Side::Consumer)?;
    let control = ControlRegion::attach(&config.shared_memory.name)
        .map_err(|err| channel_error("attach failed", err))?;
    let snapshot = control
        .snapshot()
        .map_err(|err| channel_error("read control state failed", err))?;
    print_inspect(&InspectOutput::from(snapshot), format);
    Ok(SUCCESS)
}

fn print_inspect(out: &InspectOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Channel:");
            println!("  Name:           {}", out.name);
            println!("  Backing:        {}", out.backing);
            println!(
                "  Limits:         {}x{}x{}",
                out.max_width, out.max_height, out.max_channels
            );
            println!(
                "  Owner:          pid {} ({})",
                out.owner_pid,
                if out.owner_alive { "alive" } else { "dead" }
            );
            println!("  Closed:         {}", out.closed);
            println!("  Region size:    {} bytes", out.region_size);
            println!("  Last sequence:  {}", out.last_sequence);
            match out.latest_ready {
                Some(slot) => println!("  Latest ready:   slot {slot}"),
                None => println!("  Latest ready:   none"),
            }
            println!();

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SLOT", "STATE", "SEQ", "DIMS", "SIZE"]);
            for slot in &out.slots {
                table.add_row(vec![
                    slot.index.to_string(),
                    slot.state.to_string(),
                    slot.sequence.to_string(),
                    format!("{}x{}x{}", slot.width, slot.height, slot.channels),
                    slot.payload_size.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Raw => {
            println!("{}", out.last_sequence);
        }
    }
}
