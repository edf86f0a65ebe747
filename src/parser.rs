//! Parse orchestration: delimiters, tokens, schema version, mapping, and the
//! unknown-segment policy.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{ParserConfig, UnknownSegmentPolicy};
use crate::delimiters::Delimiters;
use crate::escape::EscapeSequenceError;
use crate::mapper::{map_segment, map_unmapped};
use crate::model::Message;
use crate::schema::{SchemaRegistry, SchemaVersion};
use crate::tokenizer::{tokenize, SegmentTokens};
use crate::HL7Error;

/// A recoverable problem met while parsing. The message is still returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseIssue {
    /// Segment code missing from the schema version
    UnknownSegment { index: usize, code: String },
    /// Malformed escape sequence, kept undecoded in the leaf value
    EscapeSequence {
        index: usize,
        segment: String,
        field: usize,
        error: EscapeSequenceError,
    },
}

impl fmt::Display for ParseIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseIssue::UnknownSegment { index, code } => {
                write!(f, "segment {} ({}) is not defined in the schema", index + 1, code)
            }
            ParseIssue::EscapeSequence {
                segment,
                field,
                error,
                ..
            } => write!(f, "{}-{}: {}", segment, field, error),
        }
    }
}

/// Outcome of a successful parse: the best-effort message and what was recovered.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub message: Message,
    pub issues: Vec<ParseIssue>,
}

impl Parsed {
    pub fn has_unknown_segments(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| matches!(issue, ParseIssue::UnknownSegment { .. }))
    }
}

/// Parses raw messages against the versions of a schema registry.
#[derive(Debug, Clone)]
pub struct Parser {
    registry: Arc<SchemaRegistry>,
    config: ParserConfig,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(SchemaRegistry::builtin())
    }
}

impl Parser {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            config: ParserConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ParserConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Parse using the version declared in MSH-12.
    pub fn parse(&self, raw: &str) -> Result<Parsed, HL7Error> {
        let delimiters = Delimiters::resolve(raw, self.config.default_encoding_characters)?;
        let tokens = tokenize(raw, &delimiters)?;
        let schema = self.select_version(&tokens)?;
        self.map_tokens(&tokens, delimiters, &schema)
    }

    /// Parse against a named version, ignoring MSH-12.
    pub fn parse_with_version(&self, raw: &str, version: &str) -> Result<Parsed, HL7Error> {
        let schema = self.registry.version(version)?;
        self.parse_with_schema(raw, &schema)
    }

    pub fn parse_with_schema(&self, raw: &str, schema: &SchemaVersion) -> Result<Parsed, HL7Error> {
        let delimiters = Delimiters::resolve(raw, self.config.default_encoding_characters)?;
        let tokens = tokenize(raw, &delimiters)?;
        self.map_tokens(&tokens, delimiters, schema)
    }

    fn select_version(&self, tokens: &[SegmentTokens<'_>]) -> Result<Arc<SchemaVersion>, HL7Error> {
        let declared = declared_version(tokens);

        if let Some(declared) = declared {
            match self.registry.version(declared) {
                Ok(schema) => {
                    debug!(version = declared, "Using version declared in MSH-12");
                    return Ok(schema);
                }
                Err(e) if self.config.default_version.is_none() => return Err(e),
                Err(_) => {}
            }
        }

        match &self.config.default_version {
            Some(fallback) => {
                warn!(
                    declared = declared.unwrap_or_default(),
                    fallback = fallback.as_str(),
                    "Declared version unavailable, using default version"
                );
                self.registry.version(fallback)
            }
            None => Err(HL7Error::UnknownVersion(String::new())),
        }
    }

    fn map_tokens(
        &self,
        tokens: &[SegmentTokens<'_>],
        delimiters: Delimiters,
        schema: &SchemaVersion,
    ) -> Result<Parsed, HL7Error> {
        let mut issues = Vec::new();
        let mut segments = Vec::with_capacity(tokens.len());

        for (index, segment_tokens) in tokens.iter().enumerate() {
            match map_segment(segment_tokens, index, schema, &delimiters, &mut issues) {
                Ok(segment) => segments.push(segment),
                Err(HL7Error::UnknownSegment { code, .. }) => {
                    if self.config.unknown_segments == UnknownSegmentPolicy::Reject {
                        return Err(HL7Error::UnknownSegmentRejected(code));
                    }
                    warn!(
                        segment = code.as_str(),
                        index,
                        version = schema.version(),
                        "Segment not defined in schema"
                    );
                    if self.config.unknown_segments == UnknownSegmentPolicy::Tag {
                        segments.push(map_unmapped(segment_tokens, index, &delimiters, &mut issues));
                    }
                    issues.push(ParseIssue::UnknownSegment { index, code });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Parsed {
            message: Message {
                version: schema.version().to_string(),
                delimiters,
                segments,
            },
            issues,
        })
    }
}

/// First component of MSH-12, when present.
fn declared_version<'a>(tokens: &[SegmentTokens<'a>]) -> Option<&'a str> {
    let msh = tokens.iter().find(|s| s.code == "MSH")?;
    let version = msh.fields.get(11)?.first_value().trim();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}
