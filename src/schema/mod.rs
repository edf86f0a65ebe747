//! Versioned HL7 segment and datatype dictionaries.
//!
//! Each [`SchemaVersion`] is built once from JSON tables, then frozen and shared
//! through an `Arc`. Nothing mutates a version after it has been registered, so a
//! [`SchemaRegistry`] can be read from any number of threads without locking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::HL7Error;

mod builtin;

pub use builtin::BUILTIN_VERSIONS;

/// Datatype code used for fields whose type is only known at runtime, and for
/// overflow fields beyond a segment's defined field count.
pub const VARIES: &str = "VARIES";

/// Leaf datatypes with no component table entry.
pub const PRIMITIVE_DATATYPES: [&str; 11] = [
    "ST", "TX", "FT", "NM", "SI", "ID", "IS", "DT", "DTM", "TM", "GTS",
];

/// Whether a field must be populated (`opt` column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Optionality {
    Optional,
    Required,
    Conditional,
    BackwardCompatible,
}

impl TryFrom<u8> for Optionality {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Optionality::Optional),
            2 => Ok(Optionality::Required),
            3 => Ok(Optionality::Conditional),
            4 => Ok(Optionality::BackwardCompatible),
            other => Err(format!("unknown optionality code {}", other)),
        }
    }
}

impl From<Optionality> for u8 {
    fn from(value: Optionality) -> Self {
        match value {
            Optionality::Optional => 1,
            Optionality::Required => 2,
            Optionality::Conditional => 3,
            Optionality::BackwardCompatible => 4,
        }
    }
}

/// How many times a field may occur (`rep` column). `0` on the wire means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum Repeatability {
    Single,
    Unbounded,
    Bounded(u32),
}

impl From<u32> for Repeatability {
    fn from(value: u32) -> Self {
        match value {
            0 => Repeatability::Unbounded,
            1 => Repeatability::Single,
            n => Repeatability::Bounded(n),
        }
    }
}

impl From<Repeatability> for u32 {
    fn from(value: Repeatability) -> Self {
        match value {
            Repeatability::Unbounded => 0,
            Repeatability::Single => 1,
            Repeatability::Bounded(n) => n,
        }
    }
}

impl Repeatability {
    pub fn is_repeatable(&self) -> bool {
        !matches!(self, Repeatability::Single)
    }

    /// Maximum number of repetitions, `None` when unbounded.
    pub fn max_occurrences(&self) -> Option<usize> {
        match self {
            Repeatability::Single => Some(1),
            Repeatability::Unbounded => None,
            Repeatability::Bounded(n) => Some(*n as usize),
        }
    }
}

/// One positional field of a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub datatype: String,
    #[serde(rename = "desc")]
    pub description: String,
    #[serde(rename = "opt")]
    pub optionality: Optionality,
    #[serde(rename = "rep")]
    pub repeatability: Repeatability,
    #[serde(rename = "len", default)]
    pub len: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<u32>,
}

impl FieldDefinition {
    /// Maximum length in characters; `None` when the schema leaves it open.
    pub fn max_length(&self) -> Option<usize> {
        self.len.filter(|&len| len > 0)
    }

    pub fn is_required(&self) -> bool {
        self.optionality == Optionality::Required
    }
}

/// Field layout of one segment code. `fields[i]` is field number `i + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDefinition {
    #[serde(skip)]
    pub code: String,
    #[serde(rename = "desc")]
    pub description: String,
    pub fields: Vec<FieldDefinition>,
}

impl SegmentDefinition {
    /// Look up a field by its 1-based number.
    pub fn field(&self, number: usize) -> Option<&FieldDefinition> {
        number.checked_sub(1).and_then(|idx| self.fields.get(idx))
    }
}

/// One component (or sub-component) slot of a composite datatype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDefinition {
    pub datatype: String,
    #[serde(rename = "desc")]
    pub description: String,
    #[serde(rename = "len", default)]
    pub len: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<u32>,
}

/// A datatype that decomposes into components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeDefinition {
    #[serde(skip)]
    pub code: String,
    #[serde(rename = "desc")]
    pub description: String,
    pub components: Vec<ComponentDefinition>,
}

impl CompositeDefinition {
    /// Look up a component by its 1-based number.
    pub fn component(&self, number: usize) -> Option<&ComponentDefinition> {
        number.checked_sub(1).and_then(|idx| self.components.get(idx))
    }
}

/// Result of a datatype lookup: a leaf value or a composite with children.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Datatype<'a> {
    Primitive(&'a str),
    Composite(&'a CompositeDefinition),
}

impl<'a> Datatype<'a> {
    pub fn code(&self) -> &'a str {
        match *self {
            Datatype::Primitive(code) => code,
            Datatype::Composite(def) => def.code.as_str(),
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Datatype::Composite(_))
    }
}

/// All segment and datatype definitions of one HL7 release.
#[derive(Debug, Clone)]
pub struct SchemaVersion {
    version: String,
    segments: HashMap<String, SegmentDefinition>,
    datatypes: HashMap<String, CompositeDefinition>,
}

impl SchemaVersion {
    /// Build a version from a segment table and a datatype table, both in the
    /// `{ "CODE": { "desc": ..., "fields"|"components": [...] } }` shape.
    pub fn from_json(
        version: &str,
        segments_json: &str,
        datatypes_json: &str,
    ) -> Result<Self, HL7Error> {
        let segments = parse_segment_table(segments_json)?;

        let mut datatypes: HashMap<String, CompositeDefinition> =
            serde_json::from_str(datatypes_json)?;
        for (code, def) in datatypes.iter_mut() {
            def.code = code.clone();
        }

        debug!(
            version,
            segments = segments.len(),
            datatypes = datatypes.len(),
            "Loaded HL7 schema version"
        );

        Ok(Self {
            version: version.to_string(),
            segments,
            datatypes,
        })
    }

    /// Merge extra segment definitions (typically site-specific Z-segments) into
    /// this version before it is registered. Existing codes are replaced.
    pub fn with_segments_json(mut self, segments_json: &str) -> Result<Self, HL7Error> {
        let extra = parse_segment_table(segments_json)?;
        debug!(version = %self.version, added = extra.len(), "Extending schema version");
        self.segments.extend(extra);
        Ok(self)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn lookup_segment(&self, code: &str) -> Result<&SegmentDefinition, HL7Error> {
        self.segments
            .get(code)
            .ok_or_else(|| HL7Error::UnknownSegment {
                version: self.version.clone(),
                code: code.to_string(),
            })
    }

    /// Resolve a datatype code. Codes absent from the composite table are leaves.
    pub fn lookup_datatype<'a>(&'a self, code: &'a str) -> Datatype<'a> {
        match self.datatypes.get(code) {
            Some(def) => Datatype::Composite(def),
            None => Datatype::Primitive(code),
        }
    }

    /// True for composites in this version's table and the standard primitives.
    pub fn is_known_datatype(&self, code: &str) -> bool {
        self.datatypes.contains_key(code) || PRIMITIVE_DATATYPES.contains(&code)
    }

    pub fn segment_codes(&self) -> impl Iterator<Item = &str> {
        self.segments.keys().map(String::as_str)
    }
}

fn parse_segment_table(json: &str) -> Result<HashMap<String, SegmentDefinition>, HL7Error> {
    let mut segments: HashMap<String, SegmentDefinition> = serde_json::from_str(json)?;
    for (code, def) in segments.iter_mut() {
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(HL7Error::InvalidSchema(format!(
                "segment code '{}' is not three alphanumeric characters",
                code
            )));
        }
        def.code = code.clone();
    }
    Ok(segments)
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HL7 v{} ({} segments)", self.version, self.segments.len())
    }
}

/// Lookup table of frozen schema versions keyed by version string ("2.5").
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    versions: HashMap<String, Arc<SchemaVersion>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry holding the dictionaries embedded in this crate.
    pub fn builtin() -> Arc<SchemaRegistry> {
        builtin::registry()
    }

    /// Freeze `version` and add it, replacing any version with the same name.
    pub fn register(&mut self, version: SchemaVersion) -> Arc<SchemaVersion> {
        let version = Arc::new(version);
        self.versions
            .insert(version.version().to_string(), Arc::clone(&version));
        version
    }

    pub fn version(&self, version: &str) -> Result<Arc<SchemaVersion>, HL7Error> {
        self.versions
            .get(version)
            .cloned()
            .ok_or_else(|| HL7Error::UnknownVersion(version.to_string()))
    }

    pub fn lookup_segment(
        &self,
        version: &str,
        code: &str,
    ) -> Result<SegmentDefinition, HL7Error> {
        self.version(version)?.lookup_segment(code).cloned()
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.versions.keys().map(String::as_str)
    }
}
