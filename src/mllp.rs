//! MLLP transport: `<VT> message <FS><CR>` framing over TCP, ACK generation, and a
//! listener that parses, validates and acknowledges every frame it receives.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, error, info, warn};

use crate::config::MllpConfig;
use crate::delimiters::Delimiters;
use crate::encoder::Encoder as MessageEncoder;
use crate::mapper::map_unmapped;
use crate::model::{Component, Field, Message, Repetition, Segment, SegmentStatus};
use crate::parser::{Parsed, Parser};
use crate::tokenizer::{segment_lines, tokenize_segment};
use crate::validator::{DiscrepancyKind, Validator};
use crate::HL7Error;

// MLLP specific constants
const MLLP_START_BLOCK: u8 = 0x0B; // Vertical Tab
const MLLP_END_BLOCK: u8 = 0x1C; // File Separator
const MLLP_CARRIAGE_RETURN: u8 = 0x0D; // Carriage Return

/// Errors that can occur in MLLP operations
#[derive(Debug, Error)]
pub enum MllpError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid MLLP frame: {0}")]
    InvalidFrame(String),

    #[error("HL7 error: {0}")]
    Hl7Error(#[from] HL7Error),
}

/// Codec for encoding/decoding MLLP frames
#[derive(Debug, Clone)]
pub struct MllpCodec {
    max_frame_size: usize,
}

impl Default for MllpCodec {
    fn default() -> Self {
        Self::new(&MllpConfig::default())
    }
}

impl MllpCodec {
    pub fn new(config: &MllpConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
        }
    }
}

impl Decoder for MllpCodec {
    type Item = Bytes;
    type Error = MllpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(start_pos) = src.iter().position(|&b| b == MLLP_START_BLOCK) else {
            // Bytes outside a frame carry nothing.
            if !src.is_empty() {
                debug!(bytes = src.len(), "Discarding data outside an MLLP frame");
                src.clear();
            }
            return Ok(None);
        };
        if start_pos > 0 {
            let _ = src.split_to(start_pos);
        }

        if let Some(end_pos) = src
            .windows(2)
            .position(|w| w[0] == MLLP_END_BLOCK && w[1] == MLLP_CARRIAGE_RETURN)
        {
            let mut framed_message = src.split_to(end_pos + 2);
            let _ = framed_message.split_to(1);
            framed_message.truncate(framed_message.len().saturating_sub(2));

            if framed_message.len() > self.max_frame_size {
                return Err(MllpError::InvalidFrame(format!(
                    "frame of {} bytes exceeds the maximum of {}",
                    framed_message.len(),
                    self.max_frame_size
                )));
            }
            return Ok(Some(framed_message.freeze()));
        }

        // start block + payload + end sequence
        if src.len() > self.max_frame_size + 3 {
            return Err(MllpError::InvalidFrame(format!(
                "no end of frame within {} bytes",
                self.max_frame_size
            )));
        }

        Ok(None)
    }
}

impl Encoder<Bytes> for MllpCodec {
    type Error = MllpError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 3);
        dst.extend_from_slice(&[MLLP_START_BLOCK]);
        dst.extend_from_slice(&item);
        dst.extend_from_slice(&[MLLP_END_BLOCK, MLLP_CARRIAGE_RETURN]);
        Ok(())
    }
}

/// MSA-1 acknowledgment code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Application accept
    AA,
    /// Application error
    AE,
    /// Application reject
    AR,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::AA => "AA",
            AckCode::AE => "AE",
            AckCode::AR => "AR",
        }
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error condition reported in ERR-3 (HL7 table 0357) with free text for ERR-8
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckError {
    pub condition: u16,
    pub description: &'static str,
    pub text: String,
}

impl AckError {
    pub fn required_field_missing(text: impl Into<String>) -> Self {
        Self {
            condition: 101,
            description: "Required field missing",
            text: text.into(),
        }
    }

    pub fn from_error(error: &HL7Error) -> Self {
        let (condition, description) = match error {
            HL7Error::UnknownVersion(_) => (203, "Unsupported version id"),
            HL7Error::MalformedHeader(_)
            | HL7Error::EmptyMessage
            | HL7Error::UnknownSegmentRejected(_) => (100, "Segment sequence error"),
            _ => (207, "Application internal error"),
        };
        Self {
            condition,
            description,
            text: error.to_string(),
        }
    }
}

/// Build an acknowledgment for `message`. Sender and receiver are swapped,
/// MSA-2 echoes the original control id, and an ERR segment is added when
/// `error` is given.
pub fn build_ack(message: &Message, code: AckCode, error: Option<&AckError>) -> String {
    let version = message.version_id().unwrap_or(message.version.as_str());
    render_ack(message.segment("MSH"), message.delimiters, version, code, error)
}

/// Build an acknowledgment from raw text that could not be parsed. The MSH
/// segment is read lexically when it can be found at all.
pub fn build_ack_from_raw(raw: &str, code: AckCode, error: Option<&AckError>) -> String {
    let (delimiters, header) = match Delimiters::resolve(raw, true) {
        Ok(delimiters) => {
            let header = segment_lines(raw)
                .enumerate()
                .find(|(_, line)| line.starts_with("MSH"))
                .map(|(index, line)| {
                    let tokens = tokenize_segment(line, index, &delimiters);
                    map_unmapped(&tokens, index, &delimiters, &mut Vec::new())
                });
            (delimiters, header)
        }
        Err(_) => (Delimiters::default(), None),
    };
    let version = header
        .as_ref()
        .map(|msh| msh.value(12).to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "2.5".to_string());
    render_ack(header.as_ref(), delimiters, &version, code, error)
}

fn render_ack(
    original: Option<&Segment>,
    delimiters: Delimiters,
    version: &str,
    code: AckCode,
    error: Option<&AckError>,
) -> String {
    let copy = |number: usize, datatype: &str| {
        original
            .and_then(|msh| msh.field(number))
            .cloned()
            .unwrap_or_else(|| Field::empty(datatype))
    };
    let control_id = original.map(|msh| msh.value(10)).unwrap_or_default();
    let trigger = original
        .and_then(|msh| msh.field(9))
        .and_then(|f| f.repetitions.first())
        .and_then(|rep| rep.component(2))
        .map(Component::value)
        .unwrap_or_default();

    let now = chrono::Local::now();
    let message_type = Field::from_repetitions(
        "MSG",
        vec![Repetition::new(vec![
            Component::new("ID", "ACK"),
            Component::new("ID", trigger),
            Component::new("ID", "ACK"),
        ])],
    );
    let processing_id = match original.map(|msh| msh.value(11)) {
        Some(id) if !id.is_empty() => copy(11, "PT"),
        _ => Field::new("PT", "P"),
    };

    let msh = vec![
        Field::new("ST", delimiters.field.to_string()),
        Field::new("ST", delimiters.encoding_characters()),
        copy(5, "HD"),
        copy(6, "HD"),
        copy(3, "HD"),
        copy(4, "HD"),
        Field::new("DTM", now.format("%Y%m%d%H%M%S").to_string()),
        Field::empty("ST"),
        message_type,
        Field::new("ST", now.format("%Y%m%d%H%M%S%3f").to_string()),
        processing_id,
        Field::new("VID", version),
    ];
    let msa = vec![
        Field::new("ID", code.as_str()),
        Field::new("ST", control_id),
        Field::new("ST", error.map(|e| e.text.as_str()).unwrap_or_default()),
    ];

    let mut segments = vec![mapped("MSH", msh), mapped("MSA", msa)];
    if let Some(error) = error {
        let condition = Field::from_repetitions(
            "CWE",
            vec![Repetition::new(vec![
                Component::new("ST", error.condition.to_string()),
                Component::new("ST", error.description),
                Component::new("ID", "HL70357"),
            ])],
        );
        let err = vec![
            Field::empty("ELD"),
            Field::empty("ERL"),
            condition,
            Field::new("ID", "E"),
            Field::empty("CWE"),
            Field::empty("ST"),
            Field::empty("TX"),
            Field::new("TX", error.text.as_str()),
        ];
        segments.push(mapped("ERR", err));
    }

    let ack = Message {
        version: version.to_string(),
        delimiters,
        segments,
    };
    MessageEncoder::new(delimiters).encode_message(&ack)
}

fn mapped(code: &str, fields: Vec<Field>) -> Segment {
    let defined_fields = fields.len();
    Segment::new(code, SegmentStatus::Mapped { defined_fields }, fields)
}

/// Handler function for processing received HL7 messages
pub type MessageHandler = Arc<dyn Fn(&Parsed) -> Result<(), HL7Error> + Send + Sync>;

/// MLLP Server that listens for connections and handles HL7 messages
#[derive(Clone)]
pub struct MllpServer {
    address: String,
    parser: Arc<Parser>,
    handler: MessageHandler,
    config: MllpConfig,
}

impl MllpServer {
    /// Create a new MLLP server with specified address and message handler
    pub fn new<A: ToString>(address: A, handler: MessageHandler) -> Self {
        Self {
            address: address.to_string(),
            parser: Arc::new(Parser::default()),
            handler,
            config: MllpConfig::default(),
        }
    }

    pub fn with_parser(mut self, parser: Parser) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    pub fn with_config(mut self, config: MllpConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn run(&self) -> Result<(), MllpError> {
        let listener = TcpListener::bind(&self.address).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), MllpError> {
        info!("MLLP server listening on {}", listener.local_addr()?);

        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            info!("New connection from {}", addr);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, addr, &server).await {
                    error!("Error handling connection from {}: {}", addr, e);
                }
            });
        }
    }

    /// Process one frame payload and return the ACK text to send back.
    pub fn handle_frame(&self, frame: &[u8]) -> String {
        let text = match std::str::from_utf8(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("Received non-UTF8 message: {}", e);
                let lossy = String::from_utf8_lossy(frame);
                let error = AckError {
                    condition: 207,
                    description: "Application internal error",
                    text: format!("message is not valid UTF-8: {}", e),
                };
                return build_ack_from_raw(&lossy, AckCode::AR, Some(&error));
            }
        };

        let parsed = match self.parser.parse(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Error parsing HL7 message: {}", e);
                return build_ack_from_raw(text, AckCode::AR, Some(&AckError::from_error(&e)));
            }
        };
        let message = &parsed.message;

        if let Ok(schema) = self.parser.registry().version(&message.version) {
            let discrepancies =
                Validator::new(&schema, message.delimiters).validate_message(message);
            if !discrepancies.is_empty() {
                warn!(
                    control_id = message.control_id().unwrap_or_default(),
                    count = discrepancies.len(),
                    "Message does not conform to its schema"
                );
            }
            if let Some(missing) = discrepancies
                .iter()
                .find(|d| d.kind == DiscrepancyKind::MissingRequired)
            {
                let error = AckError::required_field_missing(missing.to_string());
                return build_ack(message, AckCode::AE, Some(&error));
            }
        }

        match (self.handler)(&parsed) {
            Ok(()) => build_ack(message, AckCode::AA, None),
            Err(e) => {
                error!("Error processing message: {}", e);
                build_ack(message, AckCode::AE, Some(&AckError::from_error(&e)))
            }
        }
    }
}

/// Handle a single MLLP connection
async fn handle_connection(
    socket: TcpStream,
    addr: std::net::SocketAddr,
    server: &MllpServer,
) -> Result<(), MllpError> {
    let mut framed = Framed::new(socket, MllpCodec::new(&server.config));

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        info!("Received message ({} bytes)", frame.len());
        let ack = server.handle_frame(&frame);
        framed.send(Bytes::from(ack)).await?;
        debug!("Sent acknowledgment to {}", addr);
    }

    info!("Connection closed by {}", addr);
    Ok(())
}
