//! HL7 v2 message parsing, validation and encoding driven by versioned schema
//! tables.
//!
//! ```text
//! raw text -> Delimiters -> tokenizer -> mapper (schema) -> Message
//!                                                 |            |
//!                                             validator     encoder -> raw text
//! ```

use thiserror::Error;

pub mod batch;
pub mod config;
pub mod delimiters;
pub mod encoder;
pub mod escape;
pub mod mapper;
pub mod mllp;
pub mod model;
pub mod parser;
pub mod path;
pub mod schema;
pub mod tokenizer;
pub mod validator;

// Include tests module
#[cfg(test)]
mod tests;

pub use batch::BatchReader;
pub use config::{EncoderConfig, MllpConfig, ParserConfig, UnknownSegmentPolicy};
pub use delimiters::Delimiters;
pub use encoder::Encoder;
pub use escape::EscapeSequenceError;
pub use model::{Component, Field, Message, Repetition, Segment, SegmentStatus};
pub use parser::{ParseIssue, Parsed, Parser};
pub use path::Location;
pub use schema::{SchemaRegistry, SchemaVersion};
pub use validator::{Discrepancy, DiscrepancyKind, Validator};

#[derive(Debug, Error)]
pub enum HL7Error {
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Unknown HL7 version '{0}'")]
    UnknownVersion(String),

    #[error("Segment {code} is not defined in HL7 v{version}")]
    UnknownSegment { version: String, code: String },

    #[error("Message contains no segments")]
    EmptyMessage,

    #[error("Invalid schema data: {0}")]
    InvalidSchema(String),

    #[error("Schema JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid location path: {0}")]
    InvalidPath(String),

    #[error("Definition for {expected} cannot validate segment {found}")]
    DefinitionMismatch { expected: String, found: String },

    #[error("Segment {0} is not defined and unknown segments are rejected")]
    UnknownSegmentRejected(String),

    #[error("Application error: {0}")]
    Application(String),
}

/// Parse with the built-in schemas, using the version declared in MSH-12.
pub fn parse(raw: &str) -> Result<Parsed, HL7Error> {
    Parser::default().parse(raw)
}

/// Parse with the built-in schema for `version`.
pub fn parse_with_version(raw: &str, version: &str) -> Result<Parsed, HL7Error> {
    Parser::default().parse_with_version(raw, version)
}

/// Check a message against `schema` without modifying it.
pub fn validate(message: &Message, schema: &SchemaVersion) -> Vec<Discrepancy> {
    validator::validate(message, schema)
}

/// Encode a message with its own delimiters and default settings.
pub fn encode(message: &Message) -> String {
    Encoder::new(message.delimiters).encode_message(message)
}
