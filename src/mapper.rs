//! Structural mapping of tokenized segments onto schema definitions.
//!
//! Mapping is permissive: repetitions are kept even for single-occurrence fields,
//! extra fields and components are kept with the `VARIES` datatype, and missing
//! trailing fields are padded empty. The validator reports what does not conform.

use tracing::{debug, warn};

use crate::delimiters::Delimiters;
use crate::escape::unescape;
use crate::model::{Component, Field, Repetition, Segment, SegmentStatus};
use crate::parser::ParseIssue;
use crate::schema::{Datatype, SchemaVersion, VARIES};
use crate::tokenizer::{tokenize_field, ComponentTokens, FieldTokens, RepetitionTokens, SegmentTokens};
use crate::HL7Error;

/// Fields typed `VARIES` whose real datatype is named by a sibling field:
/// `(segment, field, field holding the datatype code)`.
const DYNAMIC_DATATYPES: [(&str, usize, usize); 1] = [("OBX", 5, 2)];

/// Map one segment against its definition in `schema`.
///
/// Fails only with `UnknownSegment`; escape problems in leaf values are pushed
/// onto `issues` and the raw text is kept.
pub fn map_segment(
    tokens: &SegmentTokens<'_>,
    index: usize,
    schema: &SchemaVersion,
    delimiters: &Delimiters,
    issues: &mut Vec<ParseIssue>,
) -> Result<Segment, HL7Error> {
    let definition = schema.lookup_segment(tokens.code)?;
    let defined_fields = definition.fields.len();
    let count = tokens.fields.len().max(defined_fields);

    let mut ctx = Context {
        schema: Some(schema),
        delimiters,
        segment: tokens.code,
        index,
        issues,
    };

    let fields = (1..=count)
        .map(|number| {
            let datatype = match definition.field(number) {
                Some(def) if def.datatype == VARIES => {
                    dynamic_datatype(tokens, number, schema).unwrap_or(VARIES)
                }
                Some(def) => def.datatype.as_str(),
                None => VARIES,
            };
            ctx.field(tokens, number, datatype)
        })
        .collect();

    debug!(
        segment = tokens.code,
        index,
        fields = count,
        overflow = count - defined_fields,
        "Mapped segment"
    );

    Ok(Segment::new(
        tokens.code,
        SegmentStatus::Mapped { defined_fields },
        fields,
    ))
}

/// Keep a segment the schema does not define. Every field is typed `VARIES` and
/// split only lexically.
pub fn map_unmapped(
    tokens: &SegmentTokens<'_>,
    index: usize,
    delimiters: &Delimiters,
    issues: &mut Vec<ParseIssue>,
) -> Segment {
    let mut ctx = Context {
        schema: None,
        delimiters,
        segment: tokens.code,
        index,
        issues,
    };
    let fields = (1..=tokens.fields.len())
        .map(|number| ctx.field(tokens, number, VARIES))
        .collect();
    Segment::new(tokens.code, SegmentStatus::Unmapped, fields)
}

fn dynamic_datatype<'a>(
    tokens: &SegmentTokens<'a>,
    number: usize,
    schema: &SchemaVersion,
) -> Option<&'a str> {
    let (_, _, source) = DYNAMIC_DATATYPES
        .iter()
        .find(|(code, field, _)| *code == tokens.code && *field == number)?;
    let code = tokens.fields.get(source - 1)?.first_value().trim();
    if code.is_empty() {
        return None;
    }
    if schema.is_known_datatype(code) {
        Some(code)
    } else {
        debug!(segment = tokens.code, datatype = code, "Value type not in schema, keeping VARIES");
        None
    }
}

struct Context<'a, 'i> {
    schema: Option<&'a SchemaVersion>,
    delimiters: &'a Delimiters,
    segment: &'a str,
    index: usize,
    issues: &'i mut Vec<ParseIssue>,
}

impl Context<'_, '_> {
    fn field(&mut self, tokens: &SegmentTokens<'_>, number: usize, datatype: &str) -> Field {
        if tokens.header && number <= 2 {
            return self.header_field(number, datatype);
        }

        let padding;
        let field_tokens = match tokens.fields.get(number - 1) {
            Some(field_tokens) => field_tokens,
            None => {
                padding = tokenize_field("", self.delimiters);
                &padding
            }
        };
        self.map_field(field_tokens, number, datatype)
    }

    /// Header fields 1 and 2 describe the delimiters, so they are taken from the
    /// resolved delimiters rather than decoded.
    fn header_field(&self, number: usize, datatype: &str) -> Field {
        let value = if number == 1 {
            self.delimiters.field.to_string()
        } else {
            self.delimiters.encoding_characters()
        };
        let datatype = if datatype == VARIES { "ST" } else { datatype };
        Field::new(datatype, value)
    }

    fn map_field(&mut self, tokens: &FieldTokens<'_>, number: usize, datatype: &str) -> Field {
        let repetitions = tokens
            .repetitions
            .iter()
            .map(|rep| self.map_repetition(rep, number, datatype))
            .collect();
        Field::from_repetitions(datatype, repetitions)
    }

    fn map_repetition(
        &mut self,
        tokens: &RepetitionTokens<'_>,
        number: usize,
        datatype: &str,
    ) -> Repetition {
        let resolved = match self.schema {
            Some(schema) => schema.lookup_datatype(datatype),
            None => Datatype::Primitive(datatype),
        };

        let components = tokens
            .iter()
            .enumerate()
            .map(|(i, comp)| {
                let component_type = match resolved {
                    Datatype::Composite(def) => def
                        .component(i + 1)
                        .map(|c| c.datatype.as_str())
                        .unwrap_or(VARIES),
                    Datatype::Primitive(code) if i == 0 => code,
                    Datatype::Primitive(_) => VARIES,
                };
                self.map_component(comp, number, component_type)
            })
            .collect();
        Repetition::new(components)
    }

    fn map_component(
        &mut self,
        tokens: &ComponentTokens<'_>,
        number: usize,
        datatype: &str,
    ) -> Component {
        let subcomponents = tokens
            .iter()
            .map(|raw| {
                let (value, errors) = unescape(raw, self.delimiters);
                for error in errors {
                    warn!(
                        segment = self.segment,
                        field = number,
                        "Keeping malformed escape sequence: {}",
                        error
                    );
                    self.issues.push(ParseIssue::EscapeSequence {
                        index: self.index,
                        segment: self.segment.to_string(),
                        field: number,
                        error,
                    });
                }
                value.into_owned()
            })
            .collect();
        Component::with_subcomponents(datatype, subcomponents)
    }
}
