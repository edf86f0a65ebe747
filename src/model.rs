use serde::{Deserialize, Serialize};

use crate::delimiters::Delimiters;
use crate::path::Location;
use crate::schema::VARIES;

/// Represents a complete HL7 message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Schema version the segments were mapped against
    pub version: String,
    pub delimiters: Delimiters,
    pub segments: Vec<Segment>,
}

/// How a segment relates to the schema it was parsed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    /// Known to the schema, which defines `defined_fields` positions
    Mapped { defined_fields: usize },
    /// Code absent from the schema; fields hold the raw structure only
    Unmapped,
}

/// Represents a segment in an HL7 message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub code: String,
    pub status: SegmentStatus,
    /// `fields[0]` is field number 1
    pub fields: Vec<Field>,
}

/// Represents a field in an HL7 segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub datatype: String,
    pub repetitions: Vec<Repetition>,
}

/// One occurrence of a repeating field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repetition {
    pub components: Vec<Component>,
}

/// Represents a component in an HL7 field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub datatype: String,
    /// Decoded leaf values; a plain component has exactly one
    pub subcomponents: Vec<String>,
}

impl Message {
    /// Get a specific segment by code
    pub fn segment(&self, code: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.code == code)
    }

    /// Get all segments with a specific code
    pub fn segments_named<'a, 'b>(&'a self, code: &'b str) -> impl Iterator<Item = &'a Segment> + 'b
    where
        'a: 'b,
    {
        self.segments.iter().filter(move |s| s.code == code)
    }

    /// Value at a location such as `PID-5-1` or `OBX[2]-5`. Returns `None` when the
    /// path is malformed or points past the data.
    pub fn get(&self, path: &str) -> Option<&str> {
        Location::parse(path).ok().and_then(|loc| self.locate(&loc))
    }

    pub fn locate(&self, location: &Location) -> Option<&str> {
        let segment = self
            .segments_named(&location.segment)
            .nth(location.occurrence.checked_sub(1)?)?;
        let field = segment.field(location.field)?;
        let repetition = field.repetitions.get(location.repetition.checked_sub(1)?)?;
        let component = repetition.component(location.component.unwrap_or(1))?;
        component
            .subcomponents
            .get(location.subcomponent.unwrap_or(1).checked_sub(1)?)
            .map(String::as_str)
    }

    /// MSH-9 as written on the wire, e.g. `ADT^A01`
    pub fn message_type(&self) -> Option<String> {
        let field = self.segment("MSH")?.field(9)?;
        let repetition = field.repetitions.first()?;
        let parts: Vec<&str> = repetition
            .components
            .iter()
            .map(Component::value)
            .collect();
        let joined = parts.join(&self.delimiters.component.to_string());
        Some(joined.trim_end_matches(self.delimiters.component).to_string())
    }

    /// MSH-10
    pub fn control_id(&self) -> Option<&str> {
        self.get("MSH-10").filter(|v| !v.is_empty())
    }

    /// MSH-12, the version the sender declared
    pub fn version_id(&self) -> Option<&str> {
        self.get("MSH-12").filter(|v| !v.is_empty())
    }
}

impl Segment {
    pub fn new(code: impl Into<String>, status: SegmentStatus, fields: Vec<Field>) -> Self {
        Self {
            code: code.into(),
            status,
            fields,
        }
    }

    /// Field by 1-based number
    pub fn field(&self, number: usize) -> Option<&Field> {
        number.checked_sub(1).and_then(|idx| self.fields.get(idx))
    }

    pub fn field_mut(&mut self, number: usize) -> Option<&mut Field> {
        number.checked_sub(1).and_then(move |idx| self.fields.get_mut(idx))
    }

    /// First leaf value of a field, or `""` when absent
    pub fn value(&self, number: usize) -> &str {
        self.field(number).map(Field::value).unwrap_or_default()
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.status, SegmentStatus::Mapped { .. })
    }
}

impl Field {
    /// A single-valued field
    pub fn new(datatype: impl Into<String>, value: impl Into<String>) -> Self {
        let datatype = datatype.into();
        Self {
            repetitions: vec![Repetition::new(vec![Component::new(
                datatype.clone(),
                value,
            )])],
            datatype,
        }
    }

    /// A field with nothing in it, as produced for an omitted trailing field
    pub fn empty(datatype: impl Into<String>) -> Self {
        Self::new(datatype, "")
    }

    pub fn from_repetitions(datatype: impl Into<String>, repetitions: Vec<Repetition>) -> Self {
        Self {
            datatype: datatype.into(),
            repetitions,
        }
    }

    /// First leaf value
    pub fn value(&self) -> &str {
        self.repetitions
            .first()
            .map(Repetition::value)
            .unwrap_or_default()
    }

    /// True when the field would be written as nothing at all
    pub fn is_empty(&self) -> bool {
        match self.repetitions.as_slice() {
            [] => true,
            [only] => only.is_empty(),
            _ => false,
        }
    }

    /// True when any leaf holds text
    pub fn has_value(&self) -> bool {
        self.leaves().any(|leaf| !leaf.is_empty())
    }

    pub fn is_overflow(&self) -> bool {
        self.datatype == VARIES
    }

    /// Every leaf value, in wire order
    pub fn leaves(&self) -> impl Iterator<Item = &str> {
        self.repetitions
            .iter()
            .flat_map(|rep| rep.components.iter())
            .flat_map(|comp| comp.subcomponents.iter())
            .map(String::as_str)
    }
}

impl Repetition {
    pub fn new(components: Vec<Component>) -> Self {
        Self { components }
    }

    pub fn value(&self) -> &str {
        self.components
            .first()
            .map(Component::value)
            .unwrap_or_default()
    }

    pub fn component(&self, number: usize) -> Option<&Component> {
        number.checked_sub(1).and_then(|idx| self.components.get(idx))
    }

    pub fn is_empty(&self) -> bool {
        match self.components.as_slice() {
            [] => true,
            [only] => only.is_empty(),
            _ => false,
        }
    }
}

impl Component {
    pub fn new(datatype: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            datatype: datatype.into(),
            subcomponents: vec![value.into()],
        }
    }

    pub fn with_subcomponents(datatype: impl Into<String>, subcomponents: Vec<String>) -> Self {
        Self {
            datatype: datatype.into(),
            subcomponents,
        }
    }

    pub fn value(&self) -> &str {
        self.subcomponents
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        match self.subcomponents.as_slice() {
            [] => true,
            [only] => only.is_empty(),
            _ => false,
        }
    }
}
