//! Protocol schema: the JSON-sourced immutable description of endianness,
//! header layout, named types, packets, and transforms.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Byte order applied to all multi-byte scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Wire scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Bool,
}

impl Scalar {
    pub fn from_name(name: &str) -> Option<Scalar> {
        Some(match name {
            "int8" => Scalar::I8,
            "uint8" => Scalar::U8,
            "int16" => Scalar::I16,
            "uint16" => Scalar::U16,
            "int32" => Scalar::I32,
            "uint32" => Scalar::U32,
            "int64" => Scalar::I64,
            "uint64" => Scalar::U64,
            "float" => Scalar::F32,
            "double" => Scalar::F64,
            "bool" => Scalar::Bool,
            _ => return None,
        })
    }

    pub fn size(self) -> usize {
        match self {
            Scalar::I8 | Scalar::U8 | Scalar::Bool => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 | Scalar::F32 => 4,
            Scalar::I64 | Scalar::U64 | Scalar::F64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, Scalar::F32 | Scalar::F64 | Scalar::Bool)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Scalar::I8 | Scalar::I16 | Scalar::I32 | Scalar::I64)
    }
}

/// Declared field length: a literal byte count, the "remaining" sentinel
/// (filled from the message remainder at decode time), or absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLen {
    Fixed(u32),
    Remaining,
    Unspecified,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Scalar(Scalar),
    Str,
    Bytes,
    Array,
    User(String),
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    pub length: FieldLen,
    pub count_field: Option<String>,
    pub element: Option<String>,
}

impl FieldDef {
    /// Declared length in bytes. "remaining" and absent both resolve to 0;
    /// the decoder substitutes the message remainder for 0.
    pub fn declared_length(&self) -> usize {
        match self.length {
            FieldLen::Fixed(n) => n as usize,
            FieldLen::Remaining | FieldLen::Unspecified => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TypeDef {
    Struct(Vec<FieldDef>),
    Enum { base: Scalar, values: Vec<(String, i64)> },
}

impl TypeDef {
    /// Symbolic name for an enum value, if this is an enum and the value is
    /// declared.
    pub fn symbol_for(&self, value: i64) -> Option<&str> {
        match self {
            TypeDef::Enum { values, .. } => values
                .iter()
                .find(|(_, v)| *v == value)
                .map(|(name, _)| name.as_str()),
            TypeDef::Struct(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeaderField {
    pub name: String,
    pub ty: Scalar,
    pub offset: usize,
}

/// Resolved frame header: where to find the size and type fields, and how
/// many bytes must be buffered before either can be read.
#[derive(Debug, Clone)]
pub struct Header {
    pub size: HeaderField,
    pub ty: HeaderField,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct PacketDef {
    pub name: String,
    pub code: i64,
    pub fields: Vec<FieldDef>,
}

/// One transform stage as declared in the schema. Options are left as raw
/// JSON; each transform interprets its own.
#[derive(Debug, Clone)]
pub struct TransformSpec {
    pub kind: String,
    pub options: HashMap<String, serde_json::Value>,
}

impl TransformSpec {
    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    pub fn opt_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| v.as_u64())
    }
}

/// Immutable protocol description. Built once at startup, shared read-only
/// by the decoder, encoder, and formatter.
#[derive(Debug)]
pub struct Schema {
    pub endian: Endian,
    pub pack: u8,
    pub header: Header,
    pub transforms: Vec<TransformSpec>,
    types: HashMap<String, TypeDef>,
    packets: HashMap<i64, PacketDef>,
    by_name: HashMap<String, i64>,
}

impl Schema {
    pub fn from_file(path: &Path) -> Result<Schema> {
        let text = std::fs::read_to_string(path)
            .context(format!("Failed to read schema: {}", path.display()))?;
        Schema::from_json(&text).context(format!("Invalid schema: {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Schema> {
        let doc: Doc = serde_json::from_str(text).context("Schema is not valid JSON")?;
        resolve(doc)
    }

    pub fn packet(&self, code: i64) -> Option<&PacketDef> {
        self.packets.get(&code)
    }

    pub fn packet_by_name(&self, name: &str) -> Option<&PacketDef> {
        self.by_name.get(name).and_then(|code| self.packets.get(code))
    }

    pub fn get_type(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }
}

// -- Raw JSON document shapes --

#[derive(Deserialize)]
struct Doc {
    protocol: Option<ProtocolDoc>,
    #[serde(default)]
    transforms: Vec<TransformDoc>,
    #[serde(default)]
    types: HashMap<String, TypeDoc>,
    #[serde(default)]
    packets: Vec<PacketDoc>,
}

#[derive(Deserialize)]
struct ProtocolDoc {
    endian: Option<String>,
    pack: Option<u8>,
    header: Option<HeaderDoc>,
}

#[derive(Deserialize, Default)]
struct HeaderDoc {
    size_field: Option<String>,
    type_field: Option<String>,
    size: Option<usize>,
    #[serde(default)]
    fields: Vec<HeaderFieldDoc>,
}

#[derive(Deserialize)]
struct HeaderFieldDoc {
    name: String,
    #[serde(rename = "type")]
    ty: String,
    offset: usize,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum TypeDoc {
    Struct {
        fields: Vec<FieldDoc>,
    },
    Enum {
        base: String,
        values: HashMap<String, i64>,
    },
}

#[derive(Deserialize)]
struct FieldDoc {
    name: String,
    #[serde(rename = "type")]
    ty: String,
    length: Option<LengthDoc>,
    count_field: Option<String>,
    element: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LengthDoc {
    Literal(u32),
    Sentinel(String),
}

#[derive(Deserialize)]
struct TransformDoc {
    kind: String,
    #[serde(default)]
    options: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct PacketDoc {
    #[serde(rename = "type")]
    code: i64,
    name: String,
    #[serde(default)]
    fields: Vec<FieldDoc>,
}

// -- Resolution --

fn resolve(doc: Doc) -> Result<Schema> {
    let protocol = match doc.protocol {
        Some(p) => p,
        None => bail!("Schema has no \"protocol\" section"),
    };

    let endian = match protocol.endian.as_deref() {
        None | Some("little") => Endian::Little,
        Some("big") => Endian::Big,
        Some(other) => bail!("Unknown endianness: {}", other),
    };

    let pack = protocol.pack.unwrap_or(1);
    if !matches!(pack, 1 | 2 | 4 | 8) {
        bail!("pack must be one of 1, 2, 4, 8 (got {})", pack);
    }

    let header = resolve_header(protocol.header.unwrap_or_default())?;

    let mut types = HashMap::new();
    for (name, ty) in doc.types {
        let def = match ty {
            TypeDoc::Struct { fields } => TypeDef::Struct(resolve_fields(fields)?),
            TypeDoc::Enum { base, values } => {
                let base = Scalar::from_name(&base)
                    .with_context(|| format!("Enum {}: unknown base type {}", name, base))?;
                let mut values: Vec<(String, i64)> = values.into_iter().collect();
                values.sort_by_key(|(_, v)| *v);
                TypeDef::Enum { base, values }
            }
        };
        types.insert(name, def);
    }

    let mut packets = HashMap::new();
    let mut by_name = HashMap::new();
    for p in doc.packets {
        let fields = resolve_fields(p.fields)
            .with_context(|| format!("Packet {}", p.name))?;
        if by_name.insert(p.name.clone(), p.code).is_some() {
            bail!("Duplicate packet name: {}", p.name);
        }
        let def = PacketDef {
            name: p.name,
            code: p.code,
            fields,
        };
        if let Some(old) = packets.insert(p.code, def) {
            bail!("Duplicate packet type code {} ({})", p.code, old.name);
        }
    }

    let transforms = doc
        .transforms
        .into_iter()
        .map(|t| TransformSpec {
            kind: t.kind,
            options: t.options,
        })
        .collect();

    let schema = Schema {
        endian,
        pack,
        header,
        transforms,
        types,
        packets,
        by_name,
    };
    check_references(&schema)?;
    Ok(schema)
}

fn resolve_header(doc: HeaderDoc) -> Result<Header> {
    let size_name = doc.size_field.unwrap_or_else(|| "size".to_string());
    let type_name = doc.type_field.unwrap_or_else(|| "type".to_string());

    let mut fields: Vec<HeaderField> = Vec::new();
    if doc.fields.is_empty() {
        // Default header: 4-byte size at offset 0, 4-byte type at offset 4.
        fields.push(HeaderField {
            name: size_name.clone(),
            ty: Scalar::U32,
            offset: 0,
        });
        fields.push(HeaderField {
            name: type_name.clone(),
            ty: Scalar::U32,
            offset: 4,
        });
    } else {
        for f in doc.fields {
            let ty = Scalar::from_name(&f.ty)
                .with_context(|| format!("Header field {}: unknown type {}", f.name, f.ty))?;
            fields.push(HeaderField {
                name: f.name,
                ty,
                offset: f.offset,
            });
        }
    }

    let pick = |name: &str| -> Option<HeaderField> {
        fields.iter().find(|f| f.name == name).cloned()
    };
    let size = pick(&size_name)
        .with_context(|| format!("Header has no size field \"{}\"", size_name))?;
    let ty = pick(&type_name)
        .with_context(|| format!("Header has no type field \"{}\"", type_name))?;

    if !size.ty.is_integer() || size.ty.size() > 4 {
        bail!(
            "Size field \"{}\" must be an integer scalar of at most 32 bits",
            size.name
        );
    }

    let len = match doc.size {
        Some(n) => n,
        None => fields
            .iter()
            .map(|f| f.offset + f.ty.size())
            .max()
            .unwrap_or(0),
    };

    Ok(Header { size, ty, len })
}

fn resolve_fields(docs: Vec<FieldDoc>) -> Result<Vec<FieldDef>> {
    let mut out = Vec::with_capacity(docs.len());
    for f in docs {
        let ty = match f.ty.as_str() {
            "string" => FieldType::Str,
            "bytes" => FieldType::Bytes,
            "array" => FieldType::Array,
            other => match Scalar::from_name(other) {
                Some(s) => FieldType::Scalar(s),
                None => FieldType::User(other.to_string()),
            },
        };
        let length = match f.length {
            None => FieldLen::Unspecified,
            Some(LengthDoc::Literal(n)) => FieldLen::Fixed(n),
            Some(LengthDoc::Sentinel(s)) if s == "remaining" => FieldLen::Remaining,
            Some(LengthDoc::Sentinel(s)) => {
                bail!("Field {}: unknown length sentinel \"{}\"", f.name, s)
            }
        };
        out.push(FieldDef {
            name: f.name,
            ty,
            length,
            count_field: f.count_field,
            element: f.element,
        });
    }
    Ok(out)
}

/// Cross-reference checks: count_field must precede its user, and every
/// user-type or element name must resolve to a declared type or scalar.
fn check_references(schema: &Schema) -> Result<()> {
    let check_list = |owner: &str, fields: &[FieldDef]| -> Result<()> {
        for (i, f) in fields.iter().enumerate() {
            if let Some(cf) = &f.count_field {
                let precedes = fields[..i].iter().any(|prev| prev.name == *cf);
                if !precedes {
                    bail!(
                        "{}: count_field \"{}\" of \"{}\" does not precede it",
                        owner,
                        cf,
                        f.name
                    );
                }
            }
            if let FieldType::User(name) = &f.ty {
                if schema.get_type(name).is_none() {
                    bail!("{}: field \"{}\" has unknown type \"{}\"", owner, f.name, name);
                }
            }
            if let Some(elem) = &f.element {
                if Scalar::from_name(elem).is_none() && schema.get_type(elem).is_none() {
                    bail!(
                        "{}: field \"{}\" has unknown element type \"{}\"",
                        owner,
                        f.name,
                        elem
                    );
                }
            }
        }
        Ok(())
    };

    for def in schema.packets.values() {
        check_list(&format!("Packet {}", def.name), &def.fields)?;
    }
    for (name, ty) in &schema.types {
        if let TypeDef::Struct(fields) = ty {
            check_list(&format!("Type {}", name), fields)?;
        }
    }
    Ok(())
}
