// cgmlink: command-line companion for the sensor protocol engine
//
// Decodes records, frames writes, replays recorded BLE traces through the
// engine and runs the engine against a simulated sensor.

mod config;
mod trace;

use anyhow::{Context, Result};
use cgmlink_core::crypto::CcmProvider;
use cgmlink_core::nfc::ActivationCommand;
use cgmlink_core::sim::SimulatedSensor;
use cgmlink_core::telemetry::receiver_id;
use cgmlink_core::transport::ble::{fragment, DEFAULT_MAX_CHUNK};
use cgmlink_core::{
    Characteristic, ControlCommand, LinkError, LinkEvent, LinkRequest, LinkSession, RecordKind,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use trace::TraceStep;
use tracing_subscriber::EnvFilter;
use web_time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Parser)]
#[command(name = "cgmlink")]
#[command(about = "cgmlink: BLE protocol tools for Libre 3 class sensors", long_about = None)]
#[command(version)]
struct Cli {
    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a plaintext record
    Decode {
        /// patch-info, patch-status, glucose, event-log, fast-data, historical, clinical, activation
        record: String,
        hex: String,
    },
    /// Split a payload into offset-prefixed write chunks
    Fragment {
        hex: String,
        #[arg(short, long, default_value_t = DEFAULT_MAX_CHUNK)]
        chunk: usize,
    },
    /// Compute the receiver id for an account id
    ReceiverId { account: String },
    /// Build the NFC activation command
    Activate {
        /// Raw sensor state byte from the patch info
        #[arg(long, default_value_t = 1)]
        state: u8,
        /// Activation time in Unix seconds (default: now)
        #[arg(long)]
        time: Option<u32>,
        /// Account id the sensor is bound to
        #[arg(long, conflicts_with = "receiver")]
        account: Option<String>,
        /// Receiver id, when already known
        #[arg(long)]
        receiver: Option<u32>,
    },
    /// List characteristic roles
    Characteristics,
    /// Feed a recorded trace through the engine
    Replay { trace: PathBuf },
    /// Pair with a simulated sensor and stream readings
    Simulate {
        #[arg(short, long, default_value = "1")]
        seed: u64,
        #[arg(short, long, default_value = "3")]
        readings: u8,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _guard = init_logging(&cli, &config.log_level)?;

    match cli.command {
        Commands::Decode { record, hex } => cmd_decode(&record, &hex),
        Commands::Fragment { hex, chunk } => cmd_fragment(&hex, chunk),
        Commands::ReceiverId { account } => cmd_receiver_id(&account),
        Commands::Activate {
            state,
            time,
            account,
            receiver,
        } => cmd_activate(state, time, account.as_deref(), receiver),
        Commands::Characteristics => cmd_characteristics(),
        Commands::Replay { trace } => cmd_replay(&config, &trace),
        Commands::Simulate { seed, readings } => cmd_simulate(&config, seed, readings),
        Commands::Config { action } => cmd_config(config, action),
    }
}

/// RUST_LOG wins; otherwise the configured level
fn init_logging(
    cli: &Cli,
    log_level: &str,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let Some(path) = &cli.log_file else {
        if cli.json_logs {
            builder.json().with_writer(std::io::stderr).init();
        } else {
            builder.with_writer(std::io::stderr).init();
        }
        return Ok(None);
    };

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .context("Log file path has no file name")?;
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    if cli.json_logs {
        builder.json().with_ansi(false).with_writer(writer).init();
    } else {
        builder.with_ansi(false).with_writer(writer).init();
    }
    Ok(Some(guard))
}

fn cmd_decode(record: &str, hex: &str) -> Result<()> {
    let kind: RecordKind = record.parse()?;
    let data = hex::decode(hex.replace(' ', "")).context("Invalid hex")?;
    let decoded = kind.decode(&data)?;
    println!("{}", serde_json::to_string_pretty(&decoded)?);
    Ok(())
}

fn cmd_fragment(hex: &str, chunk: usize) -> Result<()> {
    let payload = hex::decode(hex.replace(' ', "")).context("Invalid hex")?;
    let chunks = fragment(&payload, chunk)?;
    println!(
        "{} {} bytes in {} chunks",
        "✓".green(),
        payload.len(),
        chunks.len()
    );
    for (i, c) in chunks.iter().enumerate() {
        println!("  {:>2}. {}", i + 1, hex::encode(c).bright_cyan());
    }
    Ok(())
}

fn cmd_receiver_id(account: &str) -> Result<()> {
    let id = receiver_id(account);
    println!("{} = {} (0x{:08X})", account.bright_cyan(), id, id);
    Ok(())
}

fn cmd_activate(
    state: u8,
    time: Option<u32>,
    account: Option<&str>,
    receiver: Option<u32>,
) -> Result<()> {
    let receiver = match (account, receiver) {
        (Some(account), _) => receiver_id(account),
        (None, Some(receiver)) => receiver,
        (None, None) => anyhow::bail!("Pass --account or --receiver"),
    };
    let time = match time {
        Some(time) => time,
        None => {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .context("System clock before 1970")?
                .as_secs();
            u32::try_from(secs).context("Activation time out of range")?
        }
    };

    let command = ActivationCommand::new(state, time, receiver);
    println!(
        "{} {} (0x{:02X} {})",
        "Activation".bold(),
        hex::encode(command.to_bytes()).bright_cyan(),
        command.code,
        if command.activates() { "activate" } else { "read PIN" }
    );
    println!("  receiver id  {}", command.receiver_id());
    println!("  start time   {}", command.activation_time());
    Ok(())
}

fn cmd_characteristics() -> Result<()> {
    println!("{}", "Characteristics".bold());
    println!();
    for c in Characteristic::ALL {
        let mut caps = Vec::new();
        if c.can_notify() {
            caps.push("notify");
        }
        if c.can_write() {
            caps.push("write");
        }
        println!(
            "  {:<20} {}  {}",
            c.name().bright_cyan(),
            c.uuid(),
            caps.join(",").dimmed()
        );
    }
    Ok(())
}

fn session_from_config(config: &config::Config) -> Result<LinkSession<CcmProvider>> {
    let mut provider = CcmProvider::new(config.k_auth()?);
    if let Some(ephemeral) = config.ephemeral()? {
        provider = provider.with_ephemeral(ephemeral);
    }
    Ok(LinkSession::new(config.session_config()?, provider)?)
}

fn cmd_replay(config: &config::Config, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read trace {}", path.display()))?;
    let steps = trace::parse_trace(&text)?;
    let mut session = session_from_config(config)?;

    let start = Instant::now();
    let mut now = start;
    println!("{} ({} steps)", "Replaying trace".bold(), steps.len());

    for step in steps {
        let result = match step {
            TraceStep::Pair => session.pair(now).map(|_| Vec::new()),
            TraceStep::Reconnect => session.reconnect(now).map(|_| Vec::new()),
            TraceStep::Notify {
                characteristic,
                data,
            } => session.on_notification(characteristic, &data, now),
            TraceStep::Ack => session.on_write_complete().map(|_| Vec::new()),
            TraceStep::Tick(elapsed) => {
                now += elapsed;
                session.poll_timeout(now).map(|_| Vec::new())
            }
            TraceStep::Control(command) => session.send_control(command, now).map(|id| {
                println!("  {} {} queued as #{}", "→".blue(), command, id);
                Vec::new()
            }),
            TraceStep::Disconnect => {
                session.on_disconnect();
                Ok(Vec::new())
            }
        };

        match result {
            Ok(events) => events.iter().for_each(print_event),
            Err(e) => print_error(&e),
        }
        while let Some(request) = session.poll_request() {
            print_request(&request);
        }
    }

    println!();
    println!(
        "Final state: {:?} after {} ms",
        session.handshake_state(),
        now.duration_since(start).as_millis()
    );
    Ok(())
}

fn cmd_simulate(config: &config::Config, seed: u64, readings: u8) -> Result<()> {
    println!("{}", "Simulated sensor session".bold());
    println!();

    let k_auth = config.k_auth()?;
    let session_config = config.session_config()?;
    let mut sensor = SimulatedSensor::new(k_auth, session_config.ble_pin, seed);
    let ephemeral = config.ephemeral()?.unwrap_or([0x04; 65]);
    let provider = CcmProvider::new(k_auth).with_ephemeral(ephemeral);
    let mut session = LinkSession::new(session_config, provider)?;
    let now = Instant::now();

    session.pair(now)?;
    let events = sensor.exchange(&mut session, now)?;
    events.iter().for_each(print_event);
    anyhow::ensure!(session.is_authenticated(), "Pairing did not complete");

    let life_count = 11520u16;
    for minute in 0..u16::from(readings) {
        let reading = 110 + minute * 2;
        let mut plaintext = [0u8; 29];
        plaintext[..2].copy_from_slice(&(life_count + minute).to_le_bytes());
        plaintext[2..4].copy_from_slice(&reading.to_le_bytes());
        // trend: stable
        plaintext[14] = 0x03;
        plaintext[15..17].copy_from_slice(&reading.to_le_bytes());
        plaintext[19..21].copy_from_slice(&3073u16.to_le_bytes());

        for n in sensor.glucose_reading(&plaintext)? {
            session
                .on_notification(n.characteristic, &n.data, now)?
                .iter()
                .for_each(print_event);
        }
    }

    session.send_control(
        ControlCommand::Historic {
            from_life_count: life_count,
        },
        now,
    )?;
    sensor.exchange(&mut session, now)?.iter().for_each(print_event);

    println!();
    println!("{}", "Simulation complete".green().bold());
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }

            println!();
            println!(
                "  {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
        }
    }

    Ok(())
}

fn print_event(event: &LinkEvent) {
    match event {
        LinkEvent::Authenticated => println!("  {} Authenticated", "✓".green()),
        LinkEvent::Telemetry {
            packet_type,
            sequence,
            record,
        } => {
            let json = serde_json::to_string(record).unwrap_or_else(|e| e.to_string());
            println!(
                "  {} {:?} #{} {}",
                "◆".bright_cyan(),
                packet_type,
                sequence,
                json
            );
        }
        LinkEvent::ControlCompleted {
            command,
            enqueued_id,
            status,
        } => println!(
            "  {} {} #{} completed ({})",
            "✓".green(),
            command,
            enqueued_id,
            hex::encode(status)
        ),
        LinkEvent::Discarded {
            characteristic,
            reason,
        } => println!(
            "  {} {}: {}",
            "⚠".yellow(),
            characteristic,
            reason.dimmed()
        ),
    }
}

fn print_request(request: &LinkRequest) {
    match request {
        LinkRequest::Write(write) => println!(
            "  {} write {}: {}",
            "→".blue(),
            write.characteristic,
            hex::encode(&write.data)
        ),
        LinkRequest::EnableNotifications(c) => {
            println!("  {} enable notifications: {}", "→".blue(), c)
        }
        LinkRequest::Disconnect => println!("  {} disconnect", "→".blue()),
    }
}

fn print_error(err: &LinkError) {
    if err.is_fatal() {
        println!("  {} {}", "✗".red().bold(), err.to_string().red());
    } else {
        println!("  {} {}", "!".yellow(), err);
    }
}
