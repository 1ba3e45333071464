// Text traces for `cgmlink replay`
//
// One step per line:
//   pair | reconnect | ack | disconnect
//   notify <role> <hex>
//   tick <millis>
//   control <historic|backfill|event-log|factory-data|shutdown> [lifeCount]
// Blank lines and lines starting with '#' are skipped.

use anyhow::{Context, Result};
use cgmlink_core::{Characteristic, ControlCommand};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceStep {
    Pair,
    Reconnect,
    Notify {
        characteristic: Characteristic,
        data: Vec<u8>,
    },
    Ack,
    Tick(Duration),
    Control(ControlCommand),
    Disconnect,
}

/// Parse one trace line; `None` for blanks and comments
pub fn parse_line(line: &str) -> Result<Option<TraceStep>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let step = match (verb, args.as_slice()) {
        ("pair", []) => TraceStep::Pair,
        ("reconnect", []) => TraceStep::Reconnect,
        ("ack", []) => TraceStep::Ack,
        ("disconnect", []) => TraceStep::Disconnect,
        ("notify", [role, hex_data]) => TraceStep::Notify {
            characteristic: role.parse()?,
            data: hex::decode(hex_data).context("Invalid notification hex")?,
        },
        ("tick", [millis]) => {
            TraceStep::Tick(Duration::from_millis(millis.parse().context("Invalid millis")?))
        }
        ("control", [name, rest @ ..]) => TraceStep::Control(parse_control(name, rest)?),
        _ => anyhow::bail!("Unrecognized trace line: {}", line),
    };
    Ok(Some(step))
}

/// Parse a whole trace, reporting the failing line number
pub fn parse_trace(text: &str) -> Result<Vec<TraceStep>> {
    text.lines()
        .enumerate()
        .filter_map(|(i, line)| {
            parse_line(line)
                .with_context(|| format!("line {}", i + 1))
                .transpose()
        })
        .collect()
}

fn parse_control(name: &str, rest: &[&str]) -> Result<ControlCommand> {
    let life_count = || -> Result<u16> {
        match rest {
            [] => Ok(0),
            [value] => value.parse().context("Invalid life count"),
            _ => anyhow::bail!("Too many control arguments"),
        }
    };
    Ok(match name {
        "historic" => ControlCommand::Historic {
            from_life_count: life_count()?,
        },
        "backfill" => ControlCommand::Backfill {
            from_life_count: life_count()?,
        },
        "event-log" => ControlCommand::EventLog,
        "factory-data" => ControlCommand::FactoryData,
        "shutdown" => ControlCommand::ShutdownPatch,
        other => anyhow::bail!("Unknown control command: {}", other),
    })
}
