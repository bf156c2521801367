//! Frame and decode messages from a reassembly ring.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::reassembly::ByteRing;
use crate::schema::{Endian, FieldDef, FieldType, Scalar, Schema, TypeDef};
use crate::transform::{TransformContext, TransformPipeline};

use super::{FieldMap, Value};

/// Upper bound on a declared frame size. Anything larger means the stream
/// lost framing; the decoder refuses to advance rather than swallow the
/// connection.
const MAX_FRAME: i64 = 65535;

/// One decoded message: name (synthesized for unknown type codes), numeric
/// type code, ordered field map, and the post-transform raw bytes including
/// the header.
#[derive(Debug, Clone)]
pub struct Message {
    pub name: String,
    pub code: i64,
    pub fields: FieldMap,
    pub raw: Vec<u8>,
}

/// Stateless over the schema; all per-connection state lives in the ring
/// and the transform context the caller holds.
pub struct Decoder<'a> {
    schema: &'a Schema,
    pipeline: &'a TransformPipeline,
}

impl<'a> Decoder<'a> {
    pub fn new(schema: &'a Schema, pipeline: &'a TransformPipeline) -> Self {
        Decoder { schema, pipeline }
    }

    /// Frame and decode the next message, or None if the ring does not hold
    /// a complete frame yet. Malformed payloads never fail: fields decode
    /// best-effort and the raw bytes stay the source of truth.
    pub fn next_message(
        &self,
        ring: &mut ByteRing,
        ctx: &mut TransformContext,
    ) -> Option<Message> {
        let header = ring.peek(self.schema.header.len)?;
        let size = read_scalar_int(
            header,
            self.schema.header.size.offset,
            self.schema.header.size.ty,
            self.schema.endian,
        )?;
        if size <= 0 || size > MAX_FRAME {
            return None;
        }
        let size = size as usize;

        let body = ring.peek(size)?.to_vec();
        ring.consume(size);

        let body = self.pipeline.apply(body, ctx);

        // Type field is read post-transform; a transform that shrank the
        // body below the type offset leaves no packet to look up.
        let code = read_scalar_int(
            &body,
            self.schema.header.ty.offset,
            self.schema.header.ty.ty,
            self.schema.endian,
        )
        .unwrap_or(-1);

        let message = match self.schema.packet(code) {
            None => Message {
                name: format!("Unknown({})", code),
                code,
                fields: FieldMap::new(),
                raw: body,
            },
            Some(def) => {
                let mut fields = FieldMap::new();
                let mut offset = 0;
                self.decode_fields(&body, &mut offset, &def.fields, &mut fields);
                Message {
                    name: def.name.clone(),
                    code,
                    fields,
                    raw: body,
                }
            }
        };
        Some(message)
    }

    fn decode_fields(
        &self,
        data: &[u8],
        offset: &mut usize,
        defs: &[FieldDef],
        out: &mut FieldMap,
    ) {
        for def in defs {
            let value = self.decode_field(data, offset, def, out);
            out.insert(def.name.clone(), value);
        }
    }

    fn decode_field(
        &self,
        data: &[u8],
        offset: &mut usize,
        def: &FieldDef,
        siblings: &FieldMap,
    ) -> Value {
        match &def.ty {
            FieldType::Scalar(s) => self.decode_scalar(data, offset, *s),
            FieldType::Str => {
                let len = clamp_len(def.declared_length(), data.len(), *offset);
                let window = &data[*offset..*offset + len];
                let text = match window.iter().position(|&b| b == 0) {
                    Some(nul) => &window[..nul],
                    None => window,
                };
                let value = String::from_utf8_lossy(text).into_owned();
                *offset += len;
                Value::Str(value)
            }
            FieldType::Bytes => {
                let len = clamp_len(def.declared_length(), data.len(), *offset);
                let value = data[*offset..*offset + len].to_vec();
                *offset += len;
                Value::Bytes(value)
            }
            FieldType::Array => {
                let count = def
                    .count_field
                    .as_deref()
                    .and_then(|name| siblings.get(name))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let element = def.element.as_deref().unwrap_or("");
                let mut items = Vec::new();
                for _ in 0..count {
                    let before = *offset;
                    let item = self.decode_named_type(data, offset, element);
                    if *offset == before {
                        // Out of bytes or unknown element: stop early.
                        break;
                    }
                    items.push(item);
                }
                Value::List(items)
            }
            FieldType::User(name) => self.decode_named_type(data, offset, name),
        }
    }

    fn decode_named_type(&self, data: &[u8], offset: &mut usize, name: &str) -> Value {
        if let Some(scalar) = Scalar::from_name(name) {
            return self.decode_scalar(data, offset, scalar);
        }
        match self.schema.get_type(name) {
            Some(TypeDef::Struct(fields)) => {
                let mut sub = FieldMap::new();
                self.decode_fields(data, offset, fields, &mut sub);
                Value::Map(sub)
            }
            // The numeric value is stored; symbol resolution is a formatter
            // concern.
            Some(TypeDef::Enum { base, .. }) => self.decode_scalar(data, offset, *base),
            None => Value::Bytes(Vec::new()),
        }
    }

    fn decode_scalar(&self, data: &[u8], offset: &mut usize, scalar: Scalar) -> Value {
        let size = scalar.size();
        if *offset + size > data.len() {
            // Truncated: empty value, zero size consumed.
            return zero_value(scalar);
        }
        let bytes = &data[*offset..*offset + size];
        *offset += size;
        let endian = self.schema.endian;
        match scalar {
            Scalar::Bool => Value::Bool(bytes[0] != 0),
            Scalar::F32 => Value::F64(read_f32(bytes, endian) as f64),
            Scalar::F64 => Value::F64(read_f64(bytes, endian)),
            s if s.is_signed() => Value::I64(read_int(bytes, endian)),
            _ => Value::U64(read_uint(bytes, endian)),
        }
    }
}

/// Resolve a declared field length against the message remainder: 0 and
/// overflowing lengths both clamp to whatever is left.
fn clamp_len(declared: usize, len: usize, offset: usize) -> usize {
    let remaining = len.saturating_sub(offset);
    if declared == 0 || declared > remaining {
        remaining
    } else {
        declared
    }
}

fn zero_value(scalar: Scalar) -> Value {
    match scalar {
        Scalar::Bool => Value::Bool(false),
        Scalar::F32 | Scalar::F64 => Value::F64(0.0),
        s if s.is_signed() => Value::I64(0),
        _ => Value::U64(0),
    }
}

fn read_uint(bytes: &[u8], endian: Endian) -> u64 {
    match endian {
        Endian::Little => LittleEndian::read_uint(bytes, bytes.len()),
        Endian::Big => BigEndian::read_uint(bytes, bytes.len()),
    }
}

fn read_int(bytes: &[u8], endian: Endian) -> i64 {
    match endian {
        Endian::Little => LittleEndian::read_int(bytes, bytes.len()),
        Endian::Big => BigEndian::read_int(bytes, bytes.len()),
    }
}

fn read_f32(bytes: &[u8], endian: Endian) -> f32 {
    match endian {
        Endian::Little => LittleEndian::read_f32(bytes),
        Endian::Big => BigEndian::read_f32(bytes),
    }
}

fn read_f64(bytes: &[u8], endian: Endian) -> f64 {
    match endian {
        Endian::Little => LittleEndian::read_f64(bytes),
        Endian::Big => BigEndian::read_f64(bytes),
    }
}

/// Read an integer header field (size or type) at its declared offset.
/// None when the buffer is too short or the scalar is not an integer.
pub(crate) fn read_scalar_int(
    data: &[u8],
    offset: usize,
    scalar: Scalar,
    endian: Endian,
) -> Option<i64> {
    let size = scalar.size();
    if !scalar.is_integer() || offset + size > data.len() {
        return None;
    }
    let bytes = &data[offset..offset + size];
    Some(if scalar.is_signed() {
        read_int(bytes, endian)
    } else {
        read_uint(bytes, endian) as i64
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    fn schema16() -> Schema {
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
                "packets": [
                    {"type": 257, "name": "PING", "fields": [
                        {"name": "size", "type": "uint16"},
                        {"name": "type", "type": "uint16"}
                    ]},
                    {"type": 258, "name": "HELLO", "fields": [
                        {"name": "size", "type": "uint16"},
                        {"name": "type", "type": "uint16"},
                        {"name": "who", "type": "string", "length": 8}
                    ]}
                ]
            }"#,
        )
        .unwrap()
    }

    fn decode_all(schema: &Schema, input: &[u8]) -> Vec<Message> {
        let pipeline = TransformPipeline::empty();
        let decoder = Decoder::new(schema, &pipeline);
        let mut ring = ByteRing::new();
        let mut ctx = TransformContext::new();
        ring.append(input);
        let mut out = Vec::new();
        while let Some(msg) = decoder.next_message(&mut ring, &mut ctx) {
            out.push(msg);
        }
        out
    }

    #[test]
    fn decodes_single_packet() {
        let schema = schema16();
        let msgs = decode_all(&schema, &[0x04, 0x00, 0x01, 0x01]);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].name, "PING");
        assert_eq!(msgs[0].code, 257);
        assert_eq!(msgs[0].raw, vec![0x04, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn waits_for_full_frame() {
        let schema = schema16();
        let pipeline = TransformPipeline::empty();
        let decoder = Decoder::new(&schema, &pipeline);
        let mut ring = ByteRing::new();
        let mut ctx = TransformContext::new();

        ring.append(&[0x08, 0x00, 0x01]);
        assert!(decoder.next_message(&mut ring, &mut ctx).is_none());
        ring.append(&[0x01, 0xAA, 0xBB]);
        // Header complete, body not.
        assert!(decoder.next_message(&mut ring, &mut ctx).is_none());
        ring.append(&[0xCC, 0xDD]);
        let msg = decoder.next_message(&mut ring, &mut ctx).unwrap();
        assert_eq!(msg.raw.len(), 8);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn splits_coalesced_frames() {
        let schema = schema16();
        let msgs = decode_all(
            &schema,
            &[0x04, 0x00, 0x01, 0x01, 0x04, 0x00, 0x01, 0x01],
        );
        assert_eq!(msgs.len(), 2);
        // Framing soundness: concatenated raw bytes prefix the input, no
        // gaps, no overlaps.
        assert_eq!(msgs[0].raw, msgs[1].raw);
    }

    #[test]
    fn oversized_size_refuses_to_advance() {
        let schema = schema16();
        let pipeline = TransformPipeline::empty();
        let decoder = Decoder::new(&schema, &pipeline);
        let mut ring = ByteRing::new();
        let mut ctx = TransformContext::new();

        ring.append(&[0xFF, 0xFF, 0x00, 0x00]);
        assert!(decoder.next_message(&mut ring, &mut ctx).is_none());
        assert_eq!(ring.available(), 4);
        // Still frozen on repeated calls.
        assert!(decoder.next_message(&mut ring, &mut ctx).is_none());
        assert_eq!(ring.available(), 4);
    }

    #[test]
    fn zero_size_refuses_to_advance() {
        let schema = schema16();
        let pipeline = TransformPipeline::empty();
        let decoder = Decoder::new(&schema, &pipeline);
        let mut ring = ByteRing::new();
        let mut ctx = TransformContext::new();
        ring.append(&[0x00, 0x00, 0x01, 0x01]);
        assert!(decoder.next_message(&mut ring, &mut ctx).is_none());
        assert_eq!(ring.available(), 4);
    }

    #[test]
    fn unknown_type_synthesized() {
        let schema = schema16();
        let msgs = decode_all(&schema, &[0x04, 0x00, 0xFF, 0xFF]);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].name, "Unknown(65535)");
        assert_eq!(msgs[0].code, 65535);
        assert!(msgs[0].fields.is_empty());
        assert_eq!(msgs[0].raw, vec![0x04, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn string_terminates_at_nul_consumes_declared() {
        let schema = schema16();
        let input = [
            0x0C, 0x00, 0x02, 0x01, 0x41, 0x42, 0x00, 0x58, 0x59, 0x5A, 0x00, 0x00,
        ];
        let msgs = decode_all(&schema, &input);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].name, "HELLO");
        assert_eq!(msgs[0].fields.get("who"), Some(&Value::Str("AB".into())));
    }

    #[test]
    fn truncated_scalar_yields_zero() {
        let schema = Schema::from_json(
            r#"{
                "protocol": {
                    "header": {
                        "fields": [
                            {"name": "size", "type": "uint16", "offset": 0},
                            {"name": "type", "type": "uint16", "offset": 2}
                        ]
                    }
                },
                "packets": [{"type": 1, "name": "P", "fields": [
                    {"name": "size", "type": "uint16"},
                    {"name": "type", "type": "uint16"},
                    {"name": "big", "type": "uint64"}
                ]}]
            }"#,
        )
        .unwrap();
        // Frame is complete per its declared size but too short for the
        // uint64 field.
        let msgs = decode_all(&schema, &[0x06, 0x00, 0x01, 0x00, 0xAA, 0xBB]);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].fields.get("big"), Some(&Value::U64(0)));
    }

    #[test]
    fn array_with_count_field() {
        let schema = Schema::from_json(
            r#"{
                "protocol": {
                    "header": {
                        "fields": [
                            {"name": "size", "type": "uint16", "offset": 0},
                            {"name": "type", "type": "uint16", "offset": 2}
                        ]
                    }
                },
                "packets": [{"type": 259, "name": "LIST", "fields": [
                    {"name": "size", "type": "uint16"},
                    {"name": "type", "type": "uint16"},
                    {"name": "n", "type": "uint8"},
                    {"name": "xs", "type": "array", "element": "uint16", "count_field": "n"}
                ]}]
            }"#,
        )
        .unwrap();
        let input = [
            0x0B, 0x00, 0x03, 0x01, 0x03, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00,
        ];
        let msgs = decode_all(&schema, &input);
        assert_eq!(msgs.len(), 1);
        assert_eq!(
            msgs[0].fields.get("xs"),
            Some(&Value::List(vec![
                Value::U64(1),
                Value::U64(2),
                Value::U64(3)
            ]))
        );
    }

    #[test]
    fn oversized_array_count_stops_early() {
        let schema = Schema::from_json(
            r#"{
                "protocol": {
                    "header": {
                        "fields": [
                            {"name": "size", "type": "uint16", "offset": 0},
                            {"name": "type", "type": "uint16", "offset": 2}
                        ]
                    }
                },
                "packets": [{"type": 1, "name": "P", "fields": [
                    {"name": "size", "type": "uint16"},
                    {"name": "type", "type": "uint16"},
                    {"name": "n", "type": "uint8"},
                    {"name": "xs", "type": "array", "element": "uint16", "count_field": "n"}
                ]}]
            }"#,
        )
        .unwrap();
        // Declared count 200, room for two elements.
        let input = [0x09, 0x00, 0x01, 0x00, 0xC8, 0x01, 0x00, 0x02, 0x00];
        let msgs = decode_all(&schema, &input);
        let xs = msgs[0].fields.get("xs").unwrap().as_list().unwrap();
        assert_eq!(xs.len(), 2);
    }

    #[test]
    fn nested_struct_and_enum() {
        let schema = Schema::from_json(
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
                    "Position": {"kind": "struct", "fields": [
                        {"name": "x", "type": "uint16"},
                        {"name": "y", "type": "uint16"}
                    ]},
                    "Dir": {"kind": "enum", "base": "uint8", "values": {"NORTH": 0, "EAST": 1}}
                },
                "packets": [{"type": 5, "name": "MOVE", "fields": [
                    {"name": "size", "type": "uint16"},
                    {"name": "type", "type": "uint16"},
                    {"name": "pos", "type": "Position"},
                    {"name": "dir", "type": "Dir"}
                ]}]
            }"#,
        )
        .unwrap();
        let input = [0x09, 0x00, 0x05, 0x00, 0x0A, 0x00, 0x14, 0x00, 0x01];
        let msgs = decode_all(&schema, &input);
        let pos = msgs[0].fields.get("pos").unwrap().as_map().unwrap();
        assert_eq!(pos.get("x"), Some(&Value::U64(10)));
        assert_eq!(pos.get("y"), Some(&Value::U64(20)));
        // Enum decodes to its numeric value.
        assert_eq!(msgs[0].fields.get("dir"), Some(&Value::U64(1)));
    }

    #[test]
    fn big_endian_scalars() {
        let schema = Schema::from_json(
            r#"{
                "protocol": {
                    "endian": "big",
                    "header": {
                        "fields": [
                            {"name": "size", "type": "uint16", "offset": 0},
                            {"name": "type", "type": "uint16", "offset": 2}
                        ]
                    }
                },
                "packets": [{"type": 1, "name": "P", "fields": [
                    {"name": "size", "type": "uint16"},
                    {"name": "type", "type": "uint16"},
                    {"name": "v", "type": "int32"}
                ]}]
            }"#,
        )
        .unwrap();
        let input = [0x00, 0x08, 0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFE];
        let msgs = decode_all(&schema, &input);
        assert_eq!(msgs[0].fields.get("v"), Some(&Value::I64(-2)));
    }

    #[test]
    fn remaining_bytes_field() {
        let schema = Schema::from_json(
            r#"{
                "protocol": {
                    "header": {
                        "fields": [
                            {"name": "size", "type": "uint16", "offset": 0},
                            {"name": "type", "type": "uint16", "offset": 2}
                        ]
                    }
                },
                "packets": [{"type": 1, "name": "P", "fields": [
                    {"name": "size", "type": "uint16"},
                    {"name": "type", "type": "uint16"},
                    {"name": "rest", "type": "bytes", "length": "remaining"}
                ]}]
            }"#,
        )
        .unwrap();
        let msgs = decode_all(&schema, &[0x07, 0x00, 0x01, 0x00, 0x0A, 0x0B, 0x0C]);
        assert_eq!(
            msgs[0].fields.get("rest"),
            Some(&Value::Bytes(vec![0x0A, 0x0B, 0x0C]))
        );
    }
}
