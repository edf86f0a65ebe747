//! Serialization of a message tree back to delimited text.

use crate::config::EncoderConfig;
use crate::delimiters::Delimiters;
use crate::escape::escape;
use crate::model::{Component, Field, Message, Repetition, Segment, SegmentStatus};
use crate::tokenizer::is_header_segment;

/// Writes messages with one set of delimiters.
#[derive(Debug, Clone)]
pub struct Encoder {
    delimiters: Delimiters,
    config: EncoderConfig,
}

impl Encoder {
    pub fn new(delimiters: Delimiters) -> Self {
        Self {
            delimiters,
            config: EncoderConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EncoderConfig) -> Self {
        self.config = config;
        self
    }

    /// Encode every segment, each followed by the segment terminator.
    pub fn encode_message(&self, message: &Message) -> String {
        let mut out = String::new();
        for (index, segment) in message.segments.iter().enumerate() {
            self.write_segment(&mut out, segment, index);
            out.push_str(&self.config.segment_terminator);
        }
        out
    }

    /// Encode one segment without a terminator. `index` is the segment's
    /// position in its message; the first segment carries the delimiters.
    pub fn encode_segment(&self, segment: &Segment, index: usize) -> String {
        let mut out = String::new();
        self.write_segment(&mut out, segment, index);
        out
    }

    pub fn encode_field(&self, field: &Field) -> String {
        let mut out = String::new();
        self.write_field(&mut out, field);
        out
    }

    pub fn encode_repetition(&self, repetition: &Repetition) -> String {
        let mut out = String::new();
        self.write_repetition(&mut out, repetition);
        out
    }

    pub fn encode_component(&self, component: &Component) -> String {
        let mut out = String::new();
        self.write_component(&mut out, component);
        out
    }

    fn write_segment(&self, out: &mut String, segment: &Segment, index: usize) {
        out.push_str(&segment.code);

        let written = self.written_fields(segment);
        // Fields 1 and 2 of a header segment are the delimiters themselves.
        let first_data_field = if is_header_segment(index, &segment.code) {
            out.push(self.delimiters.field);
            out.push_str(&self.delimiters.encoding_characters());
            2
        } else {
            0
        };

        for field in segment.fields.iter().take(written).skip(first_data_field) {
            out.push(self.delimiters.field);
            self.write_field(out, field);
        }
    }

    /// Number of fields to write. Empty trailing fields within the defined field
    /// count are dropped; overflow and unmapped fields are always kept.
    fn written_fields(&self, segment: &Segment) -> usize {
        let total = segment.fields.len();
        if self.config.preserve_trailing_empties {
            return total;
        }
        match segment.status {
            SegmentStatus::Unmapped => total,
            SegmentStatus::Mapped { defined_fields } if total > defined_fields => total,
            SegmentStatus::Mapped { .. } => segment
                .fields
                .iter()
                .rposition(|f| !f.is_empty())
                .map_or(0, |last| last + 1),
        }
    }

    fn write_field(&self, out: &mut String, field: &Field) {
        for (i, repetition) in field.repetitions.iter().enumerate() {
            if i > 0 {
                out.push(self.delimiters.repetition);
            }
            self.write_repetition(out, repetition);
        }
    }

    fn write_repetition(&self, out: &mut String, repetition: &Repetition) {
        for (i, component) in repetition.components.iter().enumerate() {
            if i > 0 {
                out.push(self.delimiters.component);
            }
            self.write_component(out, component);
        }
    }

    fn write_component(&self, out: &mut String, component: &Component) {
        for (i, leaf) in component.subcomponents.iter().enumerate() {
            if i > 0 {
                out.push(self.delimiters.subcomponent);
            }
            out.push_str(&escape(leaf, &self.delimiters));
        }
    }
}
