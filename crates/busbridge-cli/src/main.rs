//! # busbridge CLI
//!
//! Command-line utilities for checking mapping files and previewing what the
//! bridge would publish.

use anyhow::{bail, Context, Result};
use busbridge_core::mapping::MAX_CAN_ID;
use busbridge_core::transform::scale;
use busbridge_core::{find_duplicate_routes, CanFrame, Mapping, Scaling};
use busbridge_proto::CanPayload;
use std::env;

/// Highest standard (11-bit) CAN id.
const MAX_STANDARD_ID: u32 = 0x7FF;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "validate" => {
            if args.len() < 3 {
                eprintln!("Usage: busbridge validate <file>");
                std::process::exit(1);
            }
            let contents = std::fs::read_to_string(&args[2])
                .with_context(|| format!("Failed to read {}", args[2]))?;
            let report = validate(&contents)?;
            for line in &report.lines {
                println!("{line}");
            }
            if report.errors > 0 {
                eprintln!("{} of {} mappings invalid", report.errors, report.total);
                std::process::exit(1);
            }
            println!("{} mappings ok", report.total);
        }
        "scale" => {
            if args.len() < 6 {
                eprintln!("Usage: busbridge scale <raw> <multiplier> <offset> <decimals>");
                std::process::exit(1);
            }
            println!("{}", scale_command(&args[2], &args[3], &args[4], &args[5])?);
        }
        "frame" => {
            if args.len() < 4 {
                eprintln!("Usage: busbridge frame <can_id> <hex>");
                std::process::exit(1);
            }
            println!("{}", frame_command(&args[2], &args[3])?);
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

struct ValidationReport {
    total: usize,
    errors: usize,
    lines: Vec<String>,
}

/// Check every mapping of a JSON array and list duplicate routes.
fn validate(contents: &str) -> Result<ValidationReport> {
    let entries: Vec<serde_json::Value> =
        serde_json::from_str(contents).context("Expected a JSON array of mappings")?;

    let mut report = ValidationReport {
        total: entries.len(),
        errors: 0,
        lines: Vec::new(),
    };
    let mut valid = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        let bytes = serde_json::to_vec(entry)?;
        match Mapping::from_json(&bytes) {
            Ok(mut mapping) => {
                if mapping.id.is_empty() {
                    mapping.id = format!("#{index}");
                }
                report
                    .lines
                    .push(format!("ok      {} -> {}", mapping.id, mapping.topic));
                valid.push(mapping);
            }
            Err(e) => {
                report.errors += 1;
                report.lines.push(format!("invalid #{index}: {e}"));
            }
        }
    }

    for (first, second) in find_duplicate_routes(&valid) {
        report
            .lines
            .push(format!("warning {first} and {second} share source and topic"));
    }

    Ok(report)
}

/// Apply a scaling rule to one raw register value, rendered as published.
fn scale_command(raw: &str, multiplier: &str, offset: &str, decimals: &str) -> Result<String> {
    let raw: u16 = raw.parse().context("raw must be 0..=65535")?;
    let scaling = Scaling::new(
        multiplier.parse().context("Invalid multiplier")?,
        offset.parse().context("Invalid offset")?,
        decimals.parse().context("Invalid decimals")?,
    );

    let mut candidate = Mapping::modbus("cli", 0, 3, "cli");
    candidate.scaling = Some(scaling);
    candidate.validate()?;

    let decimals = scaling.decimals as usize;
    Ok(format!("{:.decimals$}", scale(raw, &scaling)))
}

/// Render the JSON payload published for a frame.
fn frame_command(can_id: &str, data: &str) -> Result<String> {
    let id = parse_can_id(can_id)?;
    let bytes = hex::decode(data).context("Data must be hex")?;
    if bytes.len() > 64 {
        bail!("{} data bytes, at most 64 fit in a frame", bytes.len());
    }

    let frame = CanFrame::new(id, id > MAX_STANDARD_ID, bytes);
    Ok(serde_json::to_string_pretty(&CanPayload::new(&frame, "cli"))?)
}

fn parse_can_id(input: &str) -> Result<u32> {
    let id = match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(digits) => u32::from_str_radix(digits, 16),
        None => input.parse(),
    }
    .with_context(|| format!("Invalid CAN id '{input}'"))?;

    if id > MAX_CAN_ID {
        bail!("CAN id 0x{id:X} above 0x{MAX_CAN_ID:X}");
    }
    Ok(id)
}

fn print_help() {
    println!(
        r#"busbridge CLI

USAGE:
    busbridge <COMMAND> [OPTIONS]

COMMANDS:
    validate <file>                           Validate a JSON array of mappings
    scale <raw> <multiplier> <offset> <dec>   Scale a raw register value
    frame <can_id> <hex>                      Render the MQTT payload of a CAN frame
    help                                      Show this help message

EXAMPLES:
    busbridge validate mappings.json
    busbridge scale 250 0.1 0 1
    busbridge frame 0x0F6 0102
"#
    );
}
