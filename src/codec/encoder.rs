//! Encode a field map back into the byte sequence the decoder would have
//! consumed.
//!
//! Transforms are deliberately not re-applied: the log stores post-transform
//! bytes, so replayed messages go out as the plaintext trace.

use anyhow::{anyhow, bail, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::schema::{Endian, FieldDef, FieldLen, FieldType, Scalar, Schema, TypeDef};

use super::{FieldMap, Value};

pub struct Encoder<'a> {
    schema: &'a Schema,
}

impl<'a> Encoder<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Encoder { schema }
    }

    /// Encode one packet by name. Missing fields write as zero; out-of-range
    /// integers truncate modulo the target width. The size field is
    /// back-patched with the total length after the body is written.
    pub fn encode(&self, name: &str, fields: &FieldMap) -> Result<Vec<u8>> {
        let def = self
            .schema
            .packet_by_name(name)
            .ok_or_else(|| anyhow!("Unknown packet: {}", name))?;

        let mut out = Vec::new();
        self.encode_fields(&mut out, &def.fields, fields)?;

        let size_field = &self.schema.header.size;
        let end = size_field.offset + size_field.ty.size();
        if out.len() < end {
            out.resize(end, 0);
        }
        let total = out.len() as u64;
        write_uint_at(
            &mut out[size_field.offset..end],
            total,
            self.schema.endian,
        );
        Ok(out)
    }

    fn encode_fields(
        &self,
        out: &mut Vec<u8>,
        defs: &[FieldDef],
        values: &FieldMap,
    ) -> Result<()> {
        for def in defs {
            self.encode_field(out, def, values.get(&def.name))?;
        }
        Ok(())
    }

    fn encode_field(
        &self,
        out: &mut Vec<u8>,
        def: &FieldDef,
        value: Option<&Value>,
    ) -> Result<()> {
        match &def.ty {
            FieldType::Scalar(s) => {
                self.write_scalar(out, *s, value);
                Ok(())
            }
            FieldType::Str => {
                let text = value.and_then(Value::as_str).unwrap_or("");
                match def.length {
                    FieldLen::Fixed(len) => {
                        let len = len as usize;
                        // Truncate to length-1 so the window always carries
                        // a terminator, then zero-pad.
                        let take = text.len().min(len.saturating_sub(1));
                        let mut bytes = text.as_bytes()[..take].to_vec();
                        bytes.resize(len, 0);
                        out.extend_from_slice(&bytes);
                    }
                    FieldLen::Remaining | FieldLen::Unspecified => {
                        out.extend_from_slice(text.as_bytes());
                    }
                }
                Ok(())
            }
            FieldType::Bytes => {
                let bytes = value.and_then(Value::as_bytes).unwrap_or(&[]);
                match def.length {
                    FieldLen::Fixed(len) => {
                        let len = len as usize;
                        let take = bytes.len().min(len);
                        let mut padded = bytes[..take].to_vec();
                        padded.resize(len, 0);
                        out.extend_from_slice(&padded);
                    }
                    FieldLen::Remaining | FieldLen::Unspecified => {
                        out.extend_from_slice(bytes);
                    }
                }
                Ok(())
            }
            FieldType::Array => {
                let element = def.element.as_deref().unwrap_or("");
                if let Some(items) = value.and_then(Value::as_list) {
                    for item in items {
                        self.encode_named_type(out, element, Some(item))?;
                    }
                }
                Ok(())
            }
            FieldType::User(name) => self.encode_named_type(out, name, value),
        }
    }

    fn encode_named_type(
        &self,
        out: &mut Vec<u8>,
        name: &str,
        value: Option<&Value>,
    ) -> Result<()> {
        if let Some(scalar) = Scalar::from_name(name) {
            self.write_scalar(out, scalar, value);
            return Ok(());
        }
        match self.schema.get_type(name) {
            Some(TypeDef::Struct(fields)) => {
                let empty = FieldMap::new();
                let sub = value.and_then(Value::as_map).unwrap_or(&empty);
                self.encode_fields(out, fields, sub)
            }
            Some(TypeDef::Enum { base, .. }) => {
                self.write_scalar(out, *base, value);
                Ok(())
            }
            None => bail!("Unknown type: {}", name),
        }
    }

    fn write_scalar(&self, out: &mut Vec<u8>, scalar: Scalar, value: Option<&Value>) {
        let endian = self.schema.endian;
        let size = scalar.size();
        let start = out.len();
        out.resize(start + size, 0);
        let buf = &mut out[start..];
        match scalar {
            Scalar::Bool => buf[0] = value.map(|v| v.coerce_u64() != 0).unwrap_or(false) as u8,
            Scalar::F32 => {
                let v = value.map(Value::coerce_f64).unwrap_or(0.0) as f32;
                match endian {
                    Endian::Little => LittleEndian::write_f32(buf, v),
                    Endian::Big => BigEndian::write_f32(buf, v),
                }
            }
            Scalar::F64 => {
                let v = value.map(Value::coerce_f64).unwrap_or(0.0);
                match endian {
                    Endian::Little => LittleEndian::write_f64(buf, v),
                    Endian::Big => BigEndian::write_f64(buf, v),
                }
            }
            _ => {
                // Signed and unsigned alike: two's complement truncation
                // modulo the target width.
                let v = value.map(Value::coerce_u64).unwrap_or(0);
                let v = if size == 8 { v } else { v & ((1u64 << (size * 8)) - 1) };
                match endian {
                    Endian::Little => LittleEndian::write_uint(buf, v, size),
                    Endian::Big => BigEndian::write_uint(buf, v, size),
                }
            }
        }
    }
}

fn write_uint_at(buf: &mut [u8], value: u64, endian: Endian) {
    let size = buf.len();
    let value = if size == 8 {
        value
    } else {
        value & ((1u64 << (size * 8)) - 1)
    };
    match endian {
        Endian::Little => LittleEndian::write_uint(buf, value, size),
        Endian::Big => BigEndian::write_uint(buf, value, size),
    }
}
