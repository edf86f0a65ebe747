//! Conformance checks of a parsed message against its schema version.
//!
//! Validation never changes the message and never fails on data problems; every
//! finding is returned as a [`Discrepancy`].

use serde::Serialize;
use std::fmt;

use crate::delimiters::Delimiters;
use crate::encoder::Encoder;
use crate::model::{Field, Message, Repetition, Segment};
use crate::path::Location;
use crate::schema::{Datatype, FieldDefinition, SchemaVersion, SegmentDefinition, VARIES};
use crate::HL7Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiscrepancyKind {
    /// A required field holds no value
    MissingRequired,
    /// A single-occurrence field repeats, or a bounded field repeats too often
    CardinalityExceeded,
    /// A leaf value is longer than the field's maximum length
    LengthExceeded,
    /// More components or sub-components than the datatype defines
    UnexpectedComponentCount,
}

impl fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DiscrepancyKind::MissingRequired => "required field is empty",
            DiscrepancyKind::CardinalityExceeded => "too many repetitions",
            DiscrepancyKind::LengthExceeded => "value too long",
            DiscrepancyKind::UnexpectedComponentCount => "unexpected components",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    pub segment: String,
    /// Position of the segment in the message, when validated as part of one
    pub segment_index: Option<usize>,
    /// 1-based field number
    pub field: usize,
    pub repetition: Option<usize>,
    pub component: Option<usize>,
    pub subcomponent: Option<usize>,
    pub kind: DiscrepancyKind,
    /// Offending value as it would be written on the wire
    pub value: String,
}

impl Discrepancy {
    fn new(segment: &Segment, field: usize, kind: DiscrepancyKind, value: impl Into<String>) -> Self {
        Self {
            segment: segment.code.clone(),
            segment_index: None,
            field,
            repetition: None,
            component: None,
            subcomponent: None,
            kind,
            value: value.into(),
        }
    }

    fn at(mut self, repetition: usize, component: Option<usize>, subcomponent: Option<usize>) -> Self {
        self.repetition = Some(repetition);
        self.component = component;
        self.subcomponent = subcomponent;
        self
    }

    /// The location in path form, e.g. `PID-8` or `PID-3(2)-4`
    pub fn location(&self) -> Location {
        Location {
            segment: self.segment.clone(),
            occurrence: 1,
            field: self.field,
            repetition: self.repetition.unwrap_or(1),
            component: self.component,
            subcomponent: self.subcomponent,
        }
    }
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location(), self.kind)?;
        if !self.value.is_empty() {
            write!(f, " ('{}')", self.value)?;
        }
        Ok(())
    }
}

/// Checks segments against the definitions of one schema version.
pub struct Validator<'a> {
    schema: &'a SchemaVersion,
    encoder: Encoder,
}

impl<'a> Validator<'a> {
    pub fn new(schema: &'a SchemaVersion, delimiters: Delimiters) -> Self {
        Self {
            schema,
            encoder: Encoder::new(delimiters),
        }
    }

    /// Validate every mapped segment. Segments the schema does not define are
    /// skipped; the parser has already reported them.
    pub fn validate_message(&self, message: &Message) -> Vec<Discrepancy> {
        let mut found = Vec::new();
        for (index, segment) in message.segments.iter().enumerate() {
            let Ok(definition) = self.schema.lookup_segment(&segment.code) else {
                continue;
            };
            if let Ok(discrepancies) = self.validate_segment(segment, definition) {
                found.extend(discrepancies.into_iter().map(|mut d| {
                    d.segment_index = Some(index);
                    d
                }));
            }
        }
        found
    }

    /// Validate one segment. Fails only when `definition` is for another code.
    pub fn validate_segment(
        &self,
        segment: &Segment,
        definition: &SegmentDefinition,
    ) -> Result<Vec<Discrepancy>, HL7Error> {
        if segment.code != definition.code {
            return Err(HL7Error::DefinitionMismatch {
                expected: definition.code.clone(),
                found: segment.code.clone(),
            });
        }

        let mut found = Vec::new();
        for (idx, def) in definition.fields.iter().enumerate() {
            let number = idx + 1;
            match segment.field(number) {
                Some(field) => self.check_field(segment, number, field, def, &mut found),
                None if def.is_required() => found.push(Discrepancy::new(
                    segment,
                    number,
                    DiscrepancyKind::MissingRequired,
                    "",
                )),
                None => {}
            }
        }
        Ok(found)
    }

    fn check_field(
        &self,
        segment: &Segment,
        number: usize,
        field: &Field,
        def: &FieldDefinition,
        found: &mut Vec<Discrepancy>,
    ) {
        if def.is_required() && !field.has_value() {
            found.push(Discrepancy::new(
                segment,
                number,
                DiscrepancyKind::MissingRequired,
                "",
            ));
        }

        if let Some(max) = def.repeatability.max_occurrences() {
            if field.repetitions.len() > max {
                found.push(Discrepancy::new(
                    segment,
                    number,
                    DiscrepancyKind::CardinalityExceeded,
                    self.encoder.encode_field(field),
                ));
            }
        }

        for (r, repetition) in field.repetitions.iter().enumerate() {
            if let Some(max_len) = def.max_length() {
                for (c, component) in repetition.components.iter().enumerate() {
                    for (s, leaf) in component.subcomponents.iter().enumerate() {
                        if leaf.chars().count() > max_len {
                            found.push(
                                Discrepancy::new(segment, number, DiscrepancyKind::LengthExceeded, leaf.as_str())
                                    .at(r + 1, Some(c + 1), Some(s + 1)),
                            );
                        }
                    }
                }
            }
            self.check_shape(segment, number, &field.datatype, r + 1, repetition, found);
        }
    }

    /// Extra components only count when they carry a value; trailing empty
    /// separators are harmless.
    fn check_shape(
        &self,
        segment: &Segment,
        number: usize,
        datatype: &str,
        repetition: usize,
        rep: &Repetition,
        found: &mut Vec<Discrepancy>,
    ) {
        if datatype == VARIES {
            return;
        }

        let allowed = match self.schema.lookup_datatype(datatype) {
            Datatype::Composite(def) => def.components.len(),
            Datatype::Primitive(_) => 1,
        };
        let extra = rep.components.iter().skip(allowed).any(|c| !c.is_empty());
        if extra {
            found.push(
                Discrepancy::new(
                    segment,
                    number,
                    DiscrepancyKind::UnexpectedComponentCount,
                    self.encoder.encode_repetition(rep),
                )
                .at(repetition, None, None),
            );
        }

        for (c, component) in rep.components.iter().enumerate().take(allowed) {
            if component.datatype == VARIES {
                continue;
            }
            let allowed_subs = match self.schema.lookup_datatype(&component.datatype) {
                Datatype::Composite(def) => def.components.len(),
                Datatype::Primitive(_) => 1,
            };
            let extra_subs = component
                .subcomponents
                .iter()
                .skip(allowed_subs)
                .any(|s| !s.is_empty());
            if extra_subs {
                found.push(
                    Discrepancy::new(
                        segment,
                        number,
                        DiscrepancyKind::UnexpectedComponentCount,
                        self.encoder.encode_component(component),
                    )
                    .at(repetition, Some(c + 1), None),
                );
            }
        }
    }
}

/// Validate a whole message against `schema`.
pub fn validate(message: &Message, schema: &SchemaVersion) -> Vec<Discrepancy> {
    Validator::new(schema, message.delimiters).validate_message(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::schema::SchemaRegistry;
    use std::sync::Arc;

    const MSH: &str = "MSH|^~\\&|APP|FAC|RCV|RFAC|20230401123000||ADT^A01|MSG1|P|2.5";

    fn check(body: &str) -> Vec<Discrepancy> {
        let raw = format!("{}\r{}", MSH, body);
        let parsed = Parser::default().parse(&raw).unwrap();
        let schema: Arc<SchemaVersion> = SchemaRegistry::builtin().version("2.5").unwrap();
        validate(&parsed.message, &schema)
    }

    fn kinds(found: &[Discrepancy]) -> Vec<(String, usize, DiscrepancyKind)> {
        found
            .iter()
            .map(|d| (d.segment.clone(), d.field, d.kind))
            .collect()
    }

    #[test]
    fn test_conformant_segment() {
        let found = check("PID|1||12345^^^MRN||DOE^JOHN||19800101|M");
        assert!(found.is_empty(), "unexpected: {:?}", found);
    }

    #[test]
    fn test_missing_required() {
        let found = check("PID|1");
        assert_eq!(
            kinds(&found),
            vec![
                ("PID".to_string(), 3, DiscrepancyKind::MissingRequired),
                ("PID".to_string(), 5, DiscrepancyKind::MissingRequired),
            ]
        );
        assert_eq!(found[0].segment_index, Some(1));
        assert_eq!(found[0].to_string(), "PID-3: required field is empty");
    }

    #[test]
    fn test_cardinality_exceeded() {
        let found = check("PID|1||123||DOE||19800101|M~F");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, DiscrepancyKind::CardinalityExceeded);
        assert_eq!(found[0].field, 8);
        assert_eq!(found[0].value, "M~F");
    }

    #[test]
    fn test_repeatable_field_allows_repetitions() {
        let found = check("PID|1||123~456||DOE~ROE");
        assert!(found.is_empty(), "unexpected: {:?}", found);
    }

    #[test]
    fn test_length_boundary() {
        assert!(check("PID|1||123||DOE||19800101|M").is_empty());

        let found = check("PID|1||123||DOE||19800101|MF");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, DiscrepancyKind::LengthExceeded);
        assert_eq!(found[0].value, "MF");
        assert_eq!(found[0].location().to_string(), "PID-8-1-1");
    }

    #[test]
    fn test_length_counts_characters() {
        // one character, two bytes
        assert!(check("PID|1||123||DOE||19800101|é").is_empty());
    }

    #[test]
    fn test_unexpected_components() {
        let found = check("PID|1||123||DOE||19800101|M^X");
        assert_eq!(
            kinds(&found),
            vec![("PID".to_string(), 8, DiscrepancyKind::UnexpectedComponentCount)]
        );
        assert_eq!(found[0].value, "M^X");

        // an empty trailing component is tolerated
        assert!(check("PID|1||123||DOE||19800101|M^").is_empty());
    }

    #[test]
    fn test_unexpected_subcomponents() {
        let found = check("PID|1||123||DOE&X&Y");
        assert!(found.is_empty(), "FN allows sub-components: {:?}", found);

        let found = check("PID|1||123&X||DOE");
        assert_eq!(
            kinds(&found),
            vec![("PID".to_string(), 3, DiscrepancyKind::UnexpectedComponentCount)]
        );
        assert_eq!(found[0].component, Some(1));
    }

    #[test]
    fn test_unknown_segments_are_skipped() {
        assert!(check("PID|1||123||DOE\rZZZ|anything|at~all").is_empty());
    }

    #[test]
    fn test_definition_mismatch() {
        let raw = format!("{}\rPID|1||123||DOE", MSH);
        let parsed = Parser::default().parse(&raw).unwrap();
        let schema = SchemaRegistry::builtin().version("2.5").unwrap();
        let validator = Validator::new(&schema, parsed.message.delimiters);
        let pid = parsed.message.segment("PID").unwrap();
        let nte = schema.lookup_segment("NTE").unwrap();
        assert!(matches!(
            validator.validate_segment(pid, nte),
            Err(HL7Error::DefinitionMismatch { ref expected, ref found }) if expected == "NTE" && found == "PID"
        ));
    }
}
