use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wiredump::capture::{self, PacketSource};
use wiredump::codec::Decoder;
use wiredump::format::{tod_millis, Formatter, LogSink};
use wiredump::reassembly::ConnTable;
use wiredump::replay::{self, PacingMode, ReplayOptions};
use wiredump::schema::Schema;
use wiredump::transform::TransformPipeline;

#[derive(Parser)]
#[command(
    name = "wiredump",
    version,
    about = "Schema-driven TCP capture, decode, and replay"
)]
struct Cli {
    /// Protocol schema (JSON)
    #[arg(short = 'p', long = "protocol")]
    schema: Option<PathBuf>,

    /// Replay SEND messages from a previously captured log
    #[arg(short = 'r', long = "replay")]
    replay: Option<PathBuf>,

    /// Replay target as host:port
    #[arg(short = 't', long)]
    target: Option<String>,

    /// Capture filter port; traffic towards it is SEND
    #[arg(long)]
    port: Option<u16>,

    /// Network interface to capture on
    #[arg(short = 'd', long)]
    interface: Option<String>,

    /// Read from a pcap file instead of live capture
    #[arg(short = 'I', long)]
    input: Option<PathBuf>,

    /// Append decoded messages to this log file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Replay pacing mode (timing, response, hybrid)
    #[arg(long, default_value = "timing")]
    mode: String,

    /// Replay response timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout: u64,

    /// Replay speed multiplier (2.0 = twice as fast)
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Override a field on every replayed message (name=value, repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE")]
    set: Vec<String>,

    /// Tear down connections idle longer than this many seconds
    #[arg(long, default_value_t = 60)]
    idle_timeout: u64,

    /// Snap length (bytes to capture per packet)
    #[arg(short = 's', long, default_value_t = 65535, value_parser = clap::value_parser!(i32).range(1..=65535))]
    snaplen: i32,

    /// Don't use promiscuous mode
    #[arg(long)]
    no_promisc: bool,

    /// List available interfaces and exit
    #[arg(short = 'L', long)]
    list_interfaces: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.list_interfaces {
        return capture::list_interfaces();
    }

    let schema_path = match &cli.schema {
        Some(p) => p,
        None => bail!("A protocol schema is required (-p <schema.json>)"),
    };
    let schema = Schema::from_file(schema_path)?;

    // Install Ctrl+C handler for graceful shutdown
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_clone = stop_flag.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if stop_clone.load(Ordering::Relaxed) {
            // Second Ctrl+C forces exit
            std::process::exit(1);
        }
        stop_clone.store(true, Ordering::Relaxed);
    }) {
        eprintln!("Warning: failed to install Ctrl+C handler: {}", e);
    }

    if let Some(log_path) = &cli.replay {
        run_replay_mode(&cli, &schema, log_path, &stop_flag)
    } else {
        run_capture_mode(&cli, &schema, &stop_flag)
    }
}

fn run_replay_mode(
    cli: &Cli,
    schema: &Schema,
    log_path: &PathBuf,
    stop_flag: &AtomicBool,
) -> Result<()> {
    let target = match &cli.target {
        Some(t) => t,
        None => bail!("--replay requires --target <host:port>"),
    };
    let mode: PacingMode = cli
        .mode
        .parse()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Invalid --mode")?;

    let mut overrides = Vec::with_capacity(cli.set.len());
    for spec in &cli.set {
        let (name, value) = spec
            .split_once('=')
            .context(format!("Invalid --set (want name=value): {}", spec))?;
        overrides.push((name.to_string(), replay::parse_value(value)));
    }

    let records = replay::read_log(log_path)?;
    let sends = records
        .iter()
        .filter(|r| r.direction == wiredump::format::Direction::Send)
        .count();
    eprintln!(
        "Replaying {} of {} records to {} (mode: {}, speed: {}x)",
        sends,
        records.len(),
        target,
        cli.mode,
        cli.speed
    );

    let opts = ReplayOptions {
        mode,
        timeout: Duration::from_millis(cli.timeout),
        speed: cli.speed,
        overrides,
    };
    let summary = replay::run(schema, &records, target, &opts, stop_flag)?;
    eprintln!(
        "Replay finished: {} sent, {} responses",
        summary.sent, summary.received
    );
    Ok(())
}

fn run_capture_mode(cli: &Cli, schema: &Schema, stop_flag: &AtomicBool) -> Result<()> {
    let port = match cli.port {
        Some(p) => p,
        None => bail!("Capture requires --port <n> (used as BPF filter and direction heuristic)"),
    };

    let mut source = if let Some(path) = &cli.input {
        PacketSource::from_file(path, port)?
    } else {
        PacketSource::live(cli.interface.as_deref(), cli.snaplen, !cli.no_promisc, port)?
    };

    let pipeline = TransformPipeline::from_specs(&schema.transforms)
        .context("Failed to build transform pipeline")?;
    let decoder = Decoder::new(schema, &pipeline);
    let formatter = Formatter::new(schema);
    let mut table = ConnTable::new(Duration::from_secs(cli.idle_timeout));
    let mut sink = match &cli.output {
        Some(path) => Some(LogSink::open(path)?),
        None => None,
    };

    let link_type = source.link_type();
    let mut message_count: u64 = 0;

    source.for_each_packet(|packet| {
        if stop_flag.load(Ordering::Relaxed) {
            return false;
        }

        let segment = match capture::parse_segment(packet.data, link_type) {
            Some(s) => s,
            None => return true,
        };
        if segment.payload.is_empty() {
            return true;
        }

        let direction = segment.direction(port);
        let time_ms = tod_millis(packet.timestamp);
        let (ring, ctx) = table.flow_mut(&segment.key);
        ring.append(&segment.payload);

        while let Some(msg) = decoder.next_message(ring, ctx) {
            message_count += 1;
            println!(
                "{}",
                formatter.console(time_ms, direction, &segment.key, &msg)
            );
            if let Some(sink) = sink.as_mut() {
                sink.write_record(&formatter.file(time_ms, direction, &segment.key, &msg));
            }
        }
        true
    })?;

    eprintln!("{} messages decoded", message_count);
    Ok(())
}
