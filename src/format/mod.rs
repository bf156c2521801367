//! Render decoded messages for the console and for the replayable log file.

use colored::Colorize;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use crate::codec::{Message, Value};
use crate::reassembly::FlowKey;
use crate::schema::Schema;

/// Console raw-hex budget before truncation.
const CONSOLE_HEX_LIMIT: usize = 64;

/// Enum type consulted when decorating the header type field.
const TYPE_ENUM: &str = "PacketType";

/// Capture-time message direction, assigned by the filter-port heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::Send => "SEND",
            Direction::Recv => "RECV",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

pub struct Formatter<'a> {
    schema: &'a Schema,
}

impl<'a> Formatter<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Formatter { schema }
    }

    /// Colored console rendering: size/type fields skipped, hex truncated.
    pub fn console(
        &self,
        time_ms: u64,
        dir: Direction,
        flow: &FlowKey,
        msg: &Message,
    ) -> String {
        let dir_str = match dir {
            Direction::Send => dir.label().green().bold(),
            Direction::Recv => dir.label().yellow().bold(),
        };
        let mut out = String::new();
        let _ = writeln!(
            out,
            "[{}] {} {} ({} bytes)",
            format_tod(time_ms).dimmed(),
            dir_str,
            msg.name.cyan(),
            msg.raw.len()
        );
        let _ = writeln!(out, "  {}", flow.to_string().dimmed());
        self.field_lines(msg, false, &mut out);
        let mut hex = hex_string(&msg.raw);
        if hex.len() > CONSOLE_HEX_LIMIT {
            hex.truncate(CONSOLE_HEX_LIMIT);
            hex.push_str("...");
        }
        let _ = write!(out, "  raw: {}", hex.dimmed());
        out
    }

    /// Plain file rendering: every field, full hex. This is the format the
    /// replay log reader parses.
    pub fn file(&self, time_ms: u64, dir: Direction, flow: &FlowKey, msg: &Message) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "[{}] {} {} ({} bytes)",
            format_tod(time_ms),
            dir.label(),
            msg.name,
            msg.raw.len()
        );
        let _ = writeln!(out, "  {}", flow);
        self.field_lines(msg, true, &mut out);
        let _ = write!(out, "  raw: {}", hex_string(&msg.raw));
        out
    }

    fn field_lines(&self, msg: &Message, include_header_fields: bool, out: &mut String) {
        let size_name = self.schema.header.size.name.as_str();
        let type_name = self.schema.header.ty.name.as_str();
        for (name, value) in msg.fields.iter() {
            if !include_header_fields && (name == size_name || name == type_name) {
                continue;
            }
            let _ = writeln!(out, "  {}: {}", name, self.render_value(name, value));
        }
    }

    /// Canonical single-line value rendering, parsed back by the replay log
    /// reader.
    pub fn render_value(&self, name: &str, value: &Value) -> String {
        if name == self.schema.header.ty.name {
            if let Some(code) = value.as_i64() {
                if let Some(symbol) = self
                    .schema
                    .get_type(TYPE_ENUM)
                    .and_then(|t| t.symbol_for(code))
                {
                    return format!("{} ({})", code, symbol);
                }
            }
        }
        render_plain(value)
    }
}

fn render_plain(value: &Value) -> String {
    match value {
        Value::I64(x) => x.to_string(),
        Value::U64(x) => x.to_string(),
        Value::F64(x) => x.to_string(),
        Value::Bool(x) => x.to_string(),
        Value::Str(s) => format!("\"{}\"", s),
        Value::Bytes(b) => hex_string(b),
        Value::List(items) => {
            let inner: Vec<String> = items.iter().map(render_plain).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Map(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(n, v)| format!("{}: {}", n, render_plain(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Milliseconds since midnight UTC.
pub fn tod_millis(now: SystemTime) -> u64 {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    (since_epoch.as_millis() % 86_400_000) as u64
}

/// Render milliseconds-since-midnight as HH:MM:SS.fff.
pub fn format_tod(ms: u64) -> String {
    let ms = ms % 86_400_000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}

/// Append-mode log file. Write failures warn once per sink rather than
/// aborting the capture.
pub struct LogSink {
    writer: BufWriter<File>,
    warned: bool,
}

impl LogSink {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context(format!("Failed to open log file: {}", path.display()))?;
        Ok(LogSink {
            writer: BufWriter::new(file),
            warned: false,
        })
    }

    pub fn write_record(&mut self, text: &str) {
        let result = writeln!(self.writer, "{}", text).and_then(|_| self.writer.flush());
        if let Err(e) = result {
            if !self.warned {
                eprintln!("Warning: failed to write log record: {}", e);
                self.warned = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FieldMap;
    use crate::schema::Schema;
    use std::net::{IpAddr, Ipv4Addr};

    fn schema() -> Schema {
        Schema::from_json(
            r#"{
                "protocol": {
                    "header": {
                        "fields": [
                            {"name": "size", "type": "uint16", "offset": 0},
                            {"name": "type", "type": "uint16", "offset": 2}
                        ]
                    }
                },
                "types": {
                    "PacketType": {"kind": "enum", "base": "uint16", "values": {"PING": 257}}
                }
            }"#,
        )
        .unwrap()
    }

    fn flow() -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5050,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            7171,
        )
    }

    fn message() -> Message {
        let mut fields = FieldMap::new();
        fields.insert("size".into(), Value::U64(4));
        fields.insert("type".into(), Value::U64(257));
        fields.insert("who".into(), Value::Str("AB".into()));
        Message {
            name: "PING".into(),
            code: 257,
            fields,
            raw: vec![0x04, 0x00, 0x01, 0x01],
        }
    }

    #[test]
    fn tod_formatting() {
        assert_eq!(format_tod(0), "00:00:00.000");
        assert_eq!(format_tod(3_600_000 + 62_500), "01:01:02.500");
        assert_eq!(format_tod(86_399_999), "23:59:59.999");
        // Wraps past midnight.
        assert_eq!(format_tod(86_400_000), "00:00:00.000");
    }

    #[test]
    fn file_rendering_is_parseable_shape() {
        let schema = schema();
        let fmt = Formatter::new(&schema);
        let text = fmt.file(500, Direction::Send, &flow(), &message());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[00:00:00.500] SEND PING (4 bytes)");
        assert_eq!(lines[1], "  10.0.0.1:5050 -> 10.0.0.2:7171");
        assert_eq!(lines[2], "  size: 4");
        assert_eq!(lines[3], "  type: 257 (PING)");
        assert_eq!(lines[4], "  who: \"AB\"");
        assert_eq!(lines[5], "  raw: 04 00 01 01");
    }

    #[test]
    fn console_skips_header_fields_and_truncates_hex() {
        colored::control::set_override(false);
        let schema = schema();
        let fmt = Formatter::new(&schema);
        let mut msg = message();
        msg.raw = vec![0xAB; 64];
        let text = fmt.console(0, Direction::Recv, &flow(), &msg);
        assert!(!text.contains("size: 4"));
        assert!(!text.contains("type: 257"));
        assert!(text.contains("who: \"AB\""));
        let raw_line = text.lines().last().unwrap();
        assert!(raw_line.ends_with("..."));
        colored::control::unset_override();
    }

    #[test]
    fn type_decoration_only_with_enum() {
        let schema = Schema::from_json(r#"{"protocol": {}}"#).unwrap();
        let fmt = Formatter::new(&schema);
        assert_eq!(fmt.render_value("type", &Value::U64(257)), "257");
    }

    #[test]
    fn compound_values_render() {
        let schema = schema();
        let fmt = Formatter::new(&schema);
        let list = Value::List(vec![Value::U64(1), Value::U64(2)]);
        assert_eq!(fmt.render_value("xs", &list), "[1, 2]");
        let mut map = FieldMap::new();
        map.insert("x".into(), Value::U64(10));
        assert_eq!(fmt.render_value("pos", &Value::Map(map)), "{x: 10}");
        assert_eq!(
            fmt.render_value("blob", &Value::Bytes(vec![0xDE, 0xAD])),
            "de ad"
        );
    }
}
