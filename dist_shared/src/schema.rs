//! Object class schemas and field-state packing.
//!
//! Every networked object belongs to a class identified by a stable numeric
//! id. A class declares an ordered list of typed fields; the server packs the
//! current value of each field into its own byte buffer so that delta
//! encoding can compare fields individually. Both sides of the wire must
//! agree on the registry contents; the hello handshake checks a stable hash
//! of the registry to reject mismatched builds.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Unique id of a live networked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DoId(pub u32);

/// Coarse logical/spatial partition key scoping object visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId(pub u32);

/// Identifies a verified client. Allocated by the server after the hello
/// handshake succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u16);

/// Wire type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Bool,
    Int,
    Uint,
    Float,
    String,
    Bytes,
}

/// A field's current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f32),
    String(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// The kind this value packs as.
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Uint(_) => FieldKind::Uint,
            FieldValue::Float(_) => FieldKind::Float,
            FieldValue::String(_) => FieldKind::String,
            FieldValue::Bytes(_) => FieldKind::Bytes,
        }
    }
}

/// A single field declaration within a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    /// Initial value for freshly generated objects.
    pub default: FieldValue,
}

impl FieldDef {
    pub fn new(name: &str, default: FieldValue) -> Self {
        Self {
            name: name.to_string(),
            kind: default.kind(),
            default,
        }
    }
}

/// One networked object class: a stable numeric id plus an ordered field
/// layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSchema {
    pub class_id: u16,
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl ClassSchema {
    pub fn new(class_id: u16, name: &str, fields: Vec<FieldDef>) -> Self {
        Self {
            class_id,
            name: name.to_string(),
            fields,
        }
    }

    /// Default field values for a freshly generated object.
    pub fn default_fields(&self) -> Vec<FieldValue> {
        self.fields.iter().map(|f| f.default.clone()).collect()
    }

    /// Index of the named field, if declared.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Most fields a single class may declare. Delta snapshots index fields with
/// a `u8`, so indices past 255 would alias on the wire.
pub const MAX_CLASS_FIELDS: usize = 256;

/// Registry of every class both sides know about.
///
/// Iteration order is the class-id order, which makes the schema hash and all
/// packed output deterministic.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    classes: BTreeMap<u16, ClassSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class. Re-registering an id replaces the previous layout.
    /// Fails if the class declares more fields than the wire format can
    /// index, see [`MAX_CLASS_FIELDS`].
    pub fn register(&mut self, class: ClassSchema) -> anyhow::Result<()> {
        if class.fields.len() > MAX_CLASS_FIELDS {
            bail!(
                "class '{}' declares {} fields, wire limit is {MAX_CLASS_FIELDS}",
                class.name,
                class.fields.len()
            );
        }
        self.classes.insert(class.class_id, class);
        Ok(())
    }

    pub fn get(&self, class_id: u16) -> Option<&ClassSchema> {
        self.classes.get(&class_id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ClassSchema> {
        self.classes.values().find(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Stable hash over class ids, names, and field layouts (FNV-1a).
    ///
    /// Clients send this in the hello handshake; a mismatch means the two
    /// builds disagree on field layouts and the connection is refused.
    pub fn schema_hash(&self) -> u32 {
        let mut h: u32 = 0x811c9dc5;
        let mut mix = |bytes: &[u8]| {
            for &b in bytes {
                h ^= u32::from(b);
                h = h.wrapping_mul(0x01000193);
            }
        };
        for class in self.classes.values() {
            mix(&class.class_id.to_le_bytes());
            mix(class.name.as_bytes());
            for field in &class.fields {
                mix(field.name.as_bytes());
                mix(&[field.kind as u8]);
            }
        }
        h
    }
}

/// The packed state of one object: one encoded buffer per field, in schema
/// order. Field-level deltas compare these buffers for byte equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedState {
    pub fields: Vec<Vec<u8>>,
}

impl PackedState {
    /// Packs every field of an object.
    pub fn pack(values: &[FieldValue]) -> Self {
        Self {
            fields: values.iter().map(encode_field).collect(),
        }
    }

    /// Decodes the packed buffers back into values using the class layout.
    pub fn unpack(&self, class: &ClassSchema) -> anyhow::Result<Vec<FieldValue>> {
        if self.fields.len() != class.fields.len() {
            bail!(
                "packed state has {} fields, class '{}' declares {}",
                self.fields.len(),
                class.name,
                class.fields.len()
            );
        }
        self.fields
            .iter()
            .zip(&class.fields)
            .map(|(buf, def)| {
                decode_field(def.kind, &mut buf.as_slice())
                    .with_context(|| format!("decode field '{}'", def.name))
            })
            .collect()
    }

    /// Indices of fields whose packed bytes differ from `baseline`.
    pub fn changed_fields(&self, baseline: &PackedState) -> Vec<usize> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(i, buf)| baseline.fields.get(*i) != Some(*buf))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Encodes one field value little-endian.
pub fn encode_field(value: &FieldValue) -> Vec<u8> {
    let mut out = Vec::new();
    match value {
        FieldValue::Bool(v) => out.put_u8(u8::from(*v)),
        FieldValue::Int(v) => out.put_i64_le(*v),
        FieldValue::Uint(v) => out.put_u64_le(*v),
        FieldValue::Float(v) => out.put_f32_le(*v),
        FieldValue::String(s) => {
            out.put_u32_le(s.len() as u32);
            out.put_slice(s.as_bytes());
        }
        FieldValue::Bytes(b) => {
            out.put_u32_le(b.len() as u32);
            out.put_slice(b);
        }
    }
    out
}

/// Decodes one field value of the given kind.
pub fn decode_field(kind: FieldKind, buf: &mut &[u8]) -> anyhow::Result<FieldValue> {
    fn need(buf: &[u8], n: usize) -> anyhow::Result<()> {
        if buf.len() < n {
            bail!("short read: need {n} bytes, have {}", buf.len());
        }
        Ok(())
    }
    Ok(match kind {
        FieldKind::Bool => {
            need(buf, 1)?;
            FieldValue::Bool(buf.get_u8() != 0)
        }
        FieldKind::Int => {
            need(buf, 8)?;
            FieldValue::Int(buf.get_i64_le())
        }
        FieldKind::Uint => {
            need(buf, 8)?;
            FieldValue::Uint(buf.get_u64_le())
        }
        FieldKind::Float => {
            need(buf, 4)?;
            FieldValue::Float(buf.get_f32_le())
        }
        FieldKind::String => {
            need(buf, 4)?;
            let len = buf.get_u32_le() as usize;
            need(buf, len)?;
            let bytes = buf[..len].to_vec();
            buf.advance(len);
            FieldValue::String(String::from_utf8(bytes).context("field not utf-8")?)
        }
        FieldKind::Bytes => {
            need(buf, 4)?;
            let len = buf.get_u32_le() as usize;
            need(buf, len)?;
            let bytes = buf[..len].to_vec();
            buf.advance(len);
            FieldValue::Bytes(bytes)
        }
    })
}
