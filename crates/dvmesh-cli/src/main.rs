//! # dvmesh CLI
//!
//! Command-line utilities for inspecting and building telegrams.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dvmesh_proto::{Fragmenter, Telegram, TelegramType};
use std::env;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "encode" => {
            if args.len() < 3 {
                eprintln!("Usage: dvmesh encode <json>");
                std::process::exit(1);
            }
            println!("{}", encode(&args[2])?);
        }
        "decode" => {
            if args.len() < 3 {
                eprintln!("Usage: dvmesh decode <base64>");
                std::process::exit(1);
            }
            println!("{}", decode(&args[2])?);
        }
        "types" => {
            for ty in TelegramType::ALL {
                println!("{:>3}  {:<8?}  {}", ty.code(), ty.priority(), ty.name());
            }
        }
        "fragments" => {
            if args.len() < 4 {
                eprintln!("Usage: dvmesh fragments <record-size> <segment-size>");
                std::process::exit(1);
            }
            let size: usize = args[2].parse().context("Invalid record size")?;
            let segment: usize = args[3].parse().context("Invalid segment size")?;
            let fragmenter = Fragmenter::new(segment)?;
            println!("{}", fragmenter.fragment_count(size));
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

/// JSON telegram to base64 wire bytes.
fn encode(json: &str) -> Result<String> {
    let telegram: Telegram = serde_json::from_str(json).context("Invalid telegram JSON")?;
    let bytes = telegram.encode().context("Failed to encode")?;
    Ok(STANDARD.encode(bytes))
}

/// Base64 wire bytes to pretty JSON.
fn decode(encoded: &str) -> Result<String> {
    let bytes = STANDARD.decode(encoded.trim()).context("Invalid base64")?;
    if bytes.is_empty() {
        bail!("no telegram bytes");
    }
    let telegram = Telegram::decode(&bytes).context("Failed to decode")?;
    Ok(serde_json::to_string_pretty(&telegram)?)
}

fn print_help() {
    println!(
        r#"dvmesh CLI

USAGE:
    dvmesh <COMMAND> [OPTIONS]

COMMANDS:
    encode <json>                    Encode a JSON telegram to base64 wire bytes
    decode <base64>                  Decode base64 wire bytes to JSON
    types                            List telegram type codes and priorities
    fragments <size> <segment>       Number of fragments for a record
    help                             Show this help message

EXAMPLES:
    dvmesh encode '{{"type":"KeepAlive","payload":null}}'
    dvmesh decode "DgAA"
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_probe_roundtrips_through_json() {
        let encoded = encode(r#"{"type":"TelegramTimeRequest","payload":{"sent_at_ms":5}}"#).unwrap();
        let json = decode(&encoded).unwrap();

        assert!(json.contains("TelegramTimeRequest"));
        assert!(json.contains("\"sent_at_ms\": 5"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode("!!!").is_err());
        assert!(decode("").is_err());
    }
}
