//! Parse capture logs back into replayable records.

use anyhow::{Context, Result};
use regex::Regex;
use std::path::Path;

use crate::codec::{FieldMap, Value};
use crate::format::Direction;

/// One logged message: time of day, direction, packet name, and the parsed
/// field map.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub time_ms: u64,
    pub direction: Direction,
    pub name: String,
    pub fields: FieldMap,
}

pub fn read_log(path: &Path) -> Result<Vec<LogRecord>> {
    let text = std::fs::read_to_string(path)
        .context(format!("Failed to read log: {}", path.display()))?;
    Ok(parse_log(&text))
}

/// Line-oriented, best-effort parse. Unrecognized lines are skipped; field
/// lines before the first record header are ignored.
pub fn parse_log(text: &str) -> Vec<LogRecord> {
    let header = Regex::new(
        r"\[(\d+):(\d+):(\d+)\.(\d+)\]\s+(SEND|RECV)\s+(\w+)\s+\(\d+\s+bytes\)",
    )
    .unwrap();
    let field = Regex::new(r"^\s+(\w+):\s+(.+)$").unwrap();

    let mut records: Vec<LogRecord> = Vec::new();
    for line in text.lines() {
        if let Some(caps) = header.captures(line) {
            let ms = |i: usize| caps[i].parse::<u64>().unwrap_or(0);
            let time_ms = ms(1) * 3_600_000 + ms(2) * 60_000 + ms(3) * 1000 + ms(4);
            let direction = if &caps[5] == "SEND" {
                Direction::Send
            } else {
                Direction::Recv
            };
            records.push(LogRecord {
                time_ms,
                direction,
                name: caps[6].to_string(),
                fields: FieldMap::new(),
            });
            continue;
        }
        // Address lines are data, not fields.
        if line.contains("->") {
            continue;
        }
        if let (Some(caps), Some(record)) = (field.captures(line), records.last_mut()) {
            let name = &caps[1];
            if name == "raw" {
                continue;
            }
            record
                .fields
                .insert(name.to_string(), parse_value(&caps[2]));
        }
    }
    records
}

/// Best-effort value parse: quoted string, `<N> (Symbol)`, integer, float,
/// raw string fallback.
pub fn parse_value(text: &str) -> Value {
    let text = text.trim();
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        return Value::Str(text[1..text.len() - 1].to_string());
    }
    if let Some(open) = text.find(" (") {
        if text.ends_with(')') {
            if let Ok(n) = text[..open].trim().parse::<i64>() {
                return Value::I64(n);
            }
        }
    }
    if let Ok(n) = text.parse::<i64>() {
        return Value::I64(n);
    }
    if let Ok(f) = text.parse::<f64>() {
        return Value::F64(f);
    }
    Value::Str(text.to_string())
}
