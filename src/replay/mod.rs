//! Re-send the send-direction messages of a prior capture log against a
//! fresh TCP endpoint under a chosen pacing policy.

mod logfile;

pub use logfile::{parse_log, parse_value, read_log, LogRecord};

use anyhow::{Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::codec::{Encoder, Value};
use crate::format::Direction;
use crate::schema::Schema;

/// Pacing policy: respect log timestamps, wait for server replies, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingMode {
    Timing,
    Response,
    Hybrid,
}

impl PacingMode {
    fn paced(self) -> bool {
        matches!(self, PacingMode::Timing | PacingMode::Hybrid)
    }

    fn waits(self) -> bool {
        matches!(self, PacingMode::Response | PacingMode::Hybrid)
    }
}

impl FromStr for PacingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timing" => Ok(PacingMode::Timing),
            "response" => Ok(PacingMode::Response),
            "hybrid" => Ok(PacingMode::Hybrid),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

pub struct ReplayOptions {
    pub mode: PacingMode,
    pub timeout: Duration,
    pub speed: f64,
    /// Applied over every SEND record's fields before encoding.
    pub overrides: Vec<(String, Value)>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        ReplayOptions {
            mode: PacingMode::Timing,
            timeout: Duration::from_millis(2000),
            speed: 1.0,
            overrides: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub sent: usize,
    pub received: usize,
}

/// Connect and drive the record list to completion. Connect and socket
/// errors are fatal to the session; response timeouts warn and continue.
/// `stop` is polled between records so an external signal ends the replay
/// cleanly.
pub fn run(
    schema: &Schema,
    records: &[LogRecord],
    target: &str,
    opts: &ReplayOptions,
    stop: &AtomicBool,
) -> Result<ReplaySummary> {
    let mut stream =
        TcpStream::connect(target).context(format!("Failed to connect to {}", target))?;
    stream.set_read_timeout(Some(opts.timeout))?;
    stream.set_nodelay(true).ok();
    replay_over(schema, records, &mut stream, opts, stop)
}

fn replay_over(
    schema: &Schema,
    records: &[LogRecord],
    stream: &mut TcpStream,
    opts: &ReplayOptions,
    stop: &AtomicBool,
) -> Result<ReplaySummary> {
    let encoder = Encoder::new(schema);
    let mut summary = ReplaySummary::default();
    let mut prev_time: Option<u64> = None;
    let mut read_buf = [0u8; 65536];
    let mut i = 0;

    while i < records.len() {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let record = &records[i];

        if record.direction == Direction::Recv {
            // RECV records only matter as response expectations after a
            // send; passing one just moves the pacing reference point.
            prev_time = Some(record.time_ms);
            i += 1;
            continue;
        }

        if opts.mode.paced() {
            std::thread::sleep(pacing_delay(prev_time, record.time_ms, opts.speed));
        }
        prev_time = Some(record.time_ms);

        let mut fields = record.fields.clone();
        for (name, value) in &opts.overrides {
            fields.insert(name.clone(), value.clone());
        }
        let bytes = match encoder.encode(&record.name, &fields) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("Warning: skipping {}: {}", record.name, e);
                i += 1;
                continue;
            }
        };

        if let Err(e) = stream.write_all(&bytes) {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            return Err(e).context("Socket write failed");
        }
        summary.sent += 1;

        if opts.mode.waits() {
            let expected = records[i + 1..]
                .iter()
                .position(|r| r.direction == Direction::Recv)
                .map(|p| i + 1 + p);
            if let Some(j) = expected {
                match stream.read(&mut read_buf) {
                    Ok(0) => {
                        eprintln!("Warning: connection closed by peer");
                        break;
                    }
                    Ok(_) => {
                        summary.received += 1;
                        prev_time = Some(records[j].time_ms);
                        i = j + 1;
                        continue;
                    }
                    Err(e)
                        if e.kind() == ErrorKind::WouldBlock
                            || e.kind() == ErrorKind::TimedOut =>
                    {
                        // Keep the RECV expectation; the next send retries
                        // the wait.
                        eprintln!(
                            "Warning: no response within {:?} after {}",
                            opts.timeout, record.name
                        );
                    }
                    Err(e) => {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        return Err(e).context("Socket read failed");
                    }
                }
            }
        }
        i += 1;
    }
    Ok(summary)
}

/// Inter-record delay scaled by the speed divisor, clamped to >= 0.
/// Timestamps that run backwards (log wrapped past midnight) clamp to zero.
fn pacing_delay(prev: Option<u64>, now_ms: u64, speed: f64) -> Duration {
    let prev = match prev {
        Some(p) => p,
        None => return Duration::ZERO,
    };
    let delta_ms = now_ms.saturating_sub(prev) as f64;
    let speed = if speed > 0.0 { speed } else { 1.0 };
    Duration::from_secs_f64(delta_ms / 1000.0 / speed)
}
