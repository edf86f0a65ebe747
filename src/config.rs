//! Parser, encoder and transport settings.
//!
//! All structs deserialize with serde and fill missing keys from their defaults,
//! so a partial JSON or TOML table is enough to override a single option.

use serde::{Deserialize, Serialize};

/// What the parser does with a segment code the schema version does not define
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownSegmentPolicy {
    /// Keep the segment as an unmapped segment and report it
    #[default]
    Tag,
    /// Drop the segment from the message and report it
    Skip,
    /// Fail the whole parse
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Assume `^~\&` when MSH-2 is empty
    pub default_encoding_characters: bool,
    pub unknown_segments: UnknownSegmentPolicy,
    /// Version used when MSH-12 is empty or names a version that is not registered
    pub default_version: Option<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            default_encoding_characters: true,
            unknown_segments: UnknownSegmentPolicy::Tag,
            default_version: None,
        }
    }
}

impl ParserConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unknown_segments(mut self, policy: UnknownSegmentPolicy) -> Self {
        self.unknown_segments = policy;
        self
    }

    pub fn with_default_version(mut self, version: impl Into<String>) -> Self {
        self.default_version = Some(version.into());
        self
    }

    pub fn with_default_encoding_characters(mut self, enabled: bool) -> Self {
        self.default_encoding_characters = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Write empty trailing fields instead of truncating them
    pub preserve_trailing_empties: bool,
    /// Written after every segment, including the last
    pub segment_terminator: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            preserve_trailing_empties: false,
            segment_terminator: "\r".to_string(),
        }
    }
}

impl EncoderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preserve_trailing_empties(mut self, preserve: bool) -> Self {
        self.preserve_trailing_empties = preserve;
        self
    }

    pub fn with_segment_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.segment_terminator = terminator.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MllpConfig {
    /// Largest accepted frame payload in bytes
    pub max_frame_size: usize,
}

impl Default for MllpConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1024 * 1024,
        }
    }
}
