//! Lexical splitting of raw HL7 text.
//!
//! Produces borrowed string tokens only. Nothing here looks at the schema, so
//! tokenizing never fails on unknown segment codes.

use crate::delimiters::{Delimiters, HEADER_SEGMENTS};
use crate::HL7Error;

/// Sub-component tokens of one component.
pub type ComponentTokens<'a> = Vec<&'a str>;

/// Component tokens of one repetition.
pub type RepetitionTokens<'a> = Vec<ComponentTokens<'a>>;

/// One field, split down to sub-components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTokens<'a> {
    pub raw: &'a str,
    pub repetitions: Vec<RepetitionTokens<'a>>,
}

impl<'a> FieldTokens<'a> {
    /// A field that must not be split, such as MSH-1 and MSH-2.
    fn literal(raw: &'a str) -> Self {
        Self {
            raw,
            repetitions: vec![vec![vec![raw]]],
        }
    }

    /// The first sub-component of the first component of the first repetition.
    pub fn first_value(&self) -> &'a str {
        self.repetitions
            .first()
            .and_then(|rep| rep.first())
            .and_then(|comp| comp.first())
            .copied()
            .unwrap_or_default()
    }
}

/// One segment line. `fields[0]` is field number 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTokens<'a> {
    pub code: &'a str,
    pub raw: &'a str,
    /// MSH, BHS, FHS, or whichever segment the delimiters were read from.
    pub header: bool,
    pub fields: Vec<FieldTokens<'a>>,
}

/// Whether the segment at `index` carries its delimiters in fields 1 and 2.
pub fn is_header_segment(index: usize, code: &str) -> bool {
    index == 0 || HEADER_SEGMENTS.contains(&code)
}

/// Split a message into segment lines. Carriage return is the standard
/// terminator; line feeds and blank lines are tolerated.
pub fn segment_lines(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(|c: char| c == '\r' || c == '\n')
        .filter(|line| !line.trim().is_empty())
}

pub fn tokenize<'a>(
    raw: &'a str,
    delimiters: &Delimiters,
) -> Result<Vec<SegmentTokens<'a>>, HL7Error> {
    let segments: Vec<SegmentTokens<'a>> = segment_lines(raw)
        .enumerate()
        .map(|(index, line)| tokenize_segment(line, index, delimiters))
        .collect();

    if segments.is_empty() {
        return Err(HL7Error::EmptyMessage);
    }
    Ok(segments)
}

/// Split one segment line. `index` is the line's position within its message.
pub fn tokenize_segment<'a>(
    line: &'a str,
    index: usize,
    delimiters: &Delimiters,
) -> SegmentTokens<'a> {
    let mut parts = split_escaped(line, delimiters.field, delimiters).into_iter();
    let head = parts.next().unwrap_or_default();
    let header = is_header_segment(index, head);

    let fields = if header {
        header_fields(line, head, delimiters)
    } else {
        parts.map(|raw| tokenize_field(raw, delimiters)).collect()
    };

    SegmentTokens {
        code: head,
        raw: line,
        header,
        fields,
    }
}

/// Header segments are laid out as `MSH` `|` `^~\&` `|` `field 3` ..., where the
/// separator itself counts as field 1.
fn header_fields<'a>(line: &'a str, code: &'a str, delimiters: &Delimiters) -> Vec<FieldTokens<'a>> {
    let after_code = &line[code.len()..];
    let Some(separator) = after_code.chars().next() else {
        return Vec::new();
    };
    let sep_len = separator.len_utf8();

    let mut fields = vec![FieldTokens::literal(&after_code[..sep_len])];
    let rest = &after_code[sep_len..];
    let (encoding, remainder) = match rest.find(delimiters.field) {
        Some(pos) => (&rest[..pos], Some(&rest[pos + delimiters.field.len_utf8()..])),
        None => (rest, None),
    };
    fields.push(FieldTokens::literal(encoding));

    if let Some(remainder) = remainder {
        fields.extend(
            split_escaped(remainder, delimiters.field, delimiters)
                .into_iter()
                .map(|raw| tokenize_field(raw, delimiters)),
        );
    }
    fields
}

/// Split a field on repetition, component and sub-component separators, in that order.
pub fn tokenize_field<'a>(raw: &'a str, delimiters: &Delimiters) -> FieldTokens<'a> {
    let repetitions = split_escaped(raw, delimiters.repetition, delimiters)
        .into_iter()
        .map(|rep| {
            split_escaped(rep, delimiters.component, delimiters)
                .into_iter()
                .map(|comp| split_escaped(comp, delimiters.subcomponent, delimiters))
                .collect()
        })
        .collect();

    FieldTokens { raw, repetitions }
}

/// Split `input` on `separator`, skipping separators inside escape sequences.
pub fn split_escaped<'a>(input: &'a str, separator: char, delimiters: &Delimiters) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut skip_to = 0;

    for (i, c) in input.char_indices() {
        if i < skip_to {
            continue;
        }
        if c == delimiters.escape {
            if let Some(len) = escape_span(&input[i..], delimiters) {
                skip_to = i + len;
            }
        } else if c == separator {
            parts.push(&input[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&input[start..]);
    parts
}

/// Byte length of the escape sequence opening `input`.
///
/// A sequence runs to the next escape character. `None` means the escape
/// character stands alone: a separator or the end of the text comes first.
fn escape_span(input: &str, delimiters: &Delimiters) -> Option<usize> {
    let esc_len = delimiters.escape.len_utf8();
    let after = &input[esc_len..];

    for (j, c) in after.char_indices() {
        if c == delimiters.escape {
            return Some(esc_len + j + c.len_utf8());
        }
        if delimiters.is_structural(c) {
            return None;
        }
    }
    None
}
