//! Lazy iteration over FHS/BHS batch files.
//!
//! A file is `[FHS] { [BHS] MSH... [BTS] } [FTS]`. Each MSH starts an
//! independent message that is parsed only when the iterator reaches it, and a
//! message ends at the next MSH or envelope segment.

use tracing::{debug, warn};

use crate::delimiters::Delimiters;
use crate::mapper::map_unmapped;
use crate::model::Segment;
use crate::parser::{Parsed, Parser};
use crate::tokenizer::tokenize_segment;
use crate::HL7Error;

const ENVELOPE_SEGMENTS: [&str; 4] = ["FHS", "BHS", "BTS", "FTS"];

/// One BHS...BTS group. Messages outside any BHS/BTS pair form a batch with
/// neither header nor trailer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub header: Option<Segment>,
    pub trailer: Option<Segment>,
    pub message_count: usize,
}

impl Batch {
    /// BTS-1, the message count declared by the sender
    pub fn declared_count(&self) -> Option<usize> {
        self.trailer
            .as_ref()
            .and_then(|bts| bts.value(1).trim().parse().ok())
    }

    /// False only when BTS-1 is present and disagrees with the message count
    pub fn count_matches(&self) -> bool {
        self.declared_count()
            .map_or(true, |declared| declared == self.message_count)
    }
}

/// Yields one parse result per message of a batch file. Cloning the reader, or
/// calling [`BatchReader::restart`], starts again from the first message.
#[derive(Debug, Clone)]
pub struct BatchReader<'a> {
    parser: &'a Parser,
    raw: &'a str,
    header: Vec<Segment>,
    trailer: Vec<Segment>,
    batches: Vec<Batch>,
    message_count: usize,
    cursor: usize,
}

impl<'a> BatchReader<'a> {
    /// Read the batch envelope in one pass. Messages are not parsed until iterated.
    pub fn new(parser: &'a Parser, raw: &'a str) -> Result<Self, HL7Error> {
        let delimiters = Delimiters::resolve(raw, parser.config().default_encoding_characters)?;

        let mut header = Vec::new();
        let mut trailer = Vec::new();
        let mut batches = Vec::new();
        let mut current: Option<Batch> = None;
        let mut message_count = 0;
        let mut ignored = Vec::new();

        for (index, (_, line)) in lines_from(raw, 0).enumerate() {
            if line.starts_with("MSH") {
                current.get_or_insert_with(Batch::default).message_count += 1;
                message_count += 1;
                continue;
            }
            if !is_envelope(line) {
                continue;
            }

            let tokens = tokenize_segment(line, index, &delimiters);
            let segment = map_unmapped(&tokens, index, &delimiters, &mut ignored);
            match segment.code.as_str() {
                "BHS" => {
                    batches.extend(current.take());
                    current = Some(Batch {
                        header: Some(segment.clone()),
                        ..Batch::default()
                    });
                    header.push(segment);
                }
                "BTS" => {
                    let mut batch = current.take().unwrap_or_default();
                    batch.trailer = Some(segment.clone());
                    batches.push(batch);
                    trailer.push(segment);
                }
                "FHS" => header.push(segment),
                _ => trailer.push(segment),
            }
        }
        batches.extend(current);

        if header.is_empty() && message_count == 0 {
            return Err(HL7Error::EmptyMessage);
        }

        for (number, batch) in batches.iter().enumerate() {
            if !batch.count_matches() {
                warn!(
                    batch = number + 1,
                    messages = batch.message_count,
                    declared = ?batch.declared_count(),
                    "Batch trailer count does not match the messages present"
                );
            }
        }
        debug!(
            messages = message_count,
            batches = batches.len(),
            "Opened HL7 batch"
        );

        Ok(Self {
            parser,
            raw,
            header,
            trailer,
            batches,
            message_count,
            cursor: 0,
        })
    }

    /// FHS and BHS segments, in file order
    pub fn header(&self) -> &[Segment] {
        &self.header
    }

    /// BTS and FTS segments, in file order
    pub fn trailer(&self) -> &[Segment] {
        &self.trailer
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Sum of every BTS-1 in the file, or `None` when no trailer declares a count
    pub fn declared_count(&self) -> Option<usize> {
        self.batches
            .iter()
            .filter_map(Batch::declared_count)
            .reduce(|a, b| a + b)
    }

    /// Number of MSH segments in the file
    pub fn message_count(&self) -> usize {
        self.message_count
    }

    /// True when every batch trailer agrees with its own batch
    pub fn count_matches(&self) -> bool {
        self.batches.iter().all(Batch::count_matches)
    }

    pub fn restart(&mut self) {
        self.cursor = 0;
    }
}

impl Iterator for BatchReader<'_> {
    type Item = Result<Parsed, HL7Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut lines = lines_from(self.raw, self.cursor);
        let Some((start, _)) = lines.find(|(_, line)| line.starts_with("MSH")) else {
            self.cursor = self.raw.len();
            return None;
        };
        let end = lines
            .find(|(_, line)| line.starts_with("MSH") || is_envelope(line))
            .map_or(self.raw.len(), |(offset, _)| offset);

        self.cursor = end;
        Some(self.parser.parse(&self.raw[start..end]))
    }
}

fn is_envelope(line: &str) -> bool {
    ENVELOPE_SEGMENTS.iter().any(|code| line.starts_with(code))
}

/// Non-blank lines of `raw` from byte `start` onwards, with their byte offsets.
fn lines_from(raw: &str, start: usize) -> impl Iterator<Item = (usize, &str)> + '_ {
    let mut pos = start;
    std::iter::from_fn(move || {
        while pos < raw.len() {
            let rest = &raw[pos..];
            let len = rest
                .find(|c: char| c == '\r' || c == '\n')
                .unwrap_or(rest.len());
            let offset = pos;
            pos += len + 1;
            let line = &rest[..len];
            if !line.trim().is_empty() {
                return Some((offset, line));
            }
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BATCH: &str = "FHS|^~\\&|LAB|HOSP\r\
BHS|^~\\&|LAB|HOSP\r\
MSH|^~\\&|LAB|HOSP|||20230401||ORU^R01|1|P|2.5\r\
PID|1||111||ONE^PATIENT\r\
MSH|^~\\&|LAB|HOSP|||20230401||ORU^R01|2|P|2.5\r\
PID|1||222||TWO^PATIENT\r\
OBX|1|NM|GLU||105\r\
BTS|2\r\
FTS|1\r";

    #[test]
    fn test_iterates_messages() {
        let parser = Parser::default();
        let reader = BatchReader::new(&parser, BATCH).unwrap();
        assert_eq!(reader.header().len(), 2);
        assert_eq!(reader.trailer().len(), 2);
        assert_eq!(reader.header()[1].value(3), "LAB");

        let messages: Vec<Parsed> = reader.map(Result::unwrap).collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message.control_id(), Some("1"));
        assert_eq!(messages[1].message.control_id(), Some("2"));
        assert_eq!(messages[1].message.segments.len(), 3);
    }

    #[test]
    fn test_declared_count() {
        let parser = Parser::default();
        let reader = BatchReader::new(&parser, BATCH).unwrap();
        assert_eq!(reader.declared_count(), Some(2));
        assert_eq!(reader.message_count(), 2);
        assert!(reader.count_matches());

        let wrong = BATCH.replace("BTS|2", "BTS|5");
        let reader = BatchReader::new(&parser, &wrong).unwrap();
        assert!(!reader.count_matches());
    }

    #[test]
    fn test_bad_message_does_not_stop_batch() {
        let raw = BATCH.replace("|2|P|2.5", "|2|P|7.7");
        let parser = Parser::default();
        let results: Vec<_> = BatchReader::new(&parser, &raw).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(HL7Error::UnknownVersion(_))));
    }

    #[test]
    fn test_restart() {
        let parser = Parser::default();
        let mut reader = BatchReader::new(&parser, BATCH).unwrap();
        assert!(reader.next().is_some());
        assert!(reader.next().is_some());
        assert!(reader.next().is_none());
        reader.restart();
        assert_eq!(reader.count(), 2);
    }

    const TWO_BATCHES: &str = "FHS|^~\\&|LAB|HOSP\r\
BHS|^~\\&|LAB|HOSP|||||||FIRST\r\
MSH|^~\\&|LAB|HOSP|||20230401||ORU^R01|1|P|2.5\r\
PID|1||111||ONE^PATIENT\r\
BTS|1\r\
BHS|^~\\&|LAB|HOSP|||||||SECOND\r\
MSH|^~\\&|LAB|HOSP|||20230401||ORU^R01|2|P|2.5\r\
PID|1||222||TWO^PATIENT\r\
MSH|^~\\&|LAB|HOSP|||20230401||ORU^R01|3|P|2.5\r\
PID|1||333||THREE^PATIENT\r\
BTS|3\r\
FTS|2\r";

    #[test]
    fn test_messages_end_at_envelope_segments() {
        let parser = Parser::default();
        let messages: Vec<Parsed> = BatchReader::new(&parser, TWO_BATCHES)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(messages.len(), 3);
        for parsed in &messages {
            let codes: Vec<&str> = parsed.message.segments.iter().map(|s| s.code.as_str()).collect();
            assert_eq!(codes, vec!["MSH", "PID"]);
        }
        assert_eq!(messages[2].message.control_id(), Some("3"));
    }

    #[test]
    fn test_counts_checked_per_batch() {
        let parser = Parser::default();
        let reader = BatchReader::new(&parser, TWO_BATCHES).unwrap();
        assert_eq!(reader.header().len(), 3);
        assert_eq!(reader.trailer().len(), 3);
        assert_eq!(reader.message_count(), 3);

        let batches = reader.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].header.as_ref().unwrap().value(11), "FIRST");
        assert_eq!(batches[0].message_count, 1);
        assert_eq!(batches[1].message_count, 2);
        assert_eq!(batches[1].declared_count(), Some(3));
        assert!(!batches[1].count_matches());
        assert!(batches[0].count_matches());
        assert!(!reader.count_matches());
        assert_eq!(reader.declared_count(), Some(4));
    }

    #[test]
    fn test_plain_messages_without_envelope() {
        let raw = "MSH|^~\\&|A|||||||1|P|2.5\nMSH|^~\\&|A|||||||2|P|2.5\n";
        let parser = Parser::default();
        let reader = BatchReader::new(&parser, raw).unwrap();
        assert!(reader.header().is_empty());
        assert_eq!(reader.declared_count(), None);
        assert_eq!(reader.batches().len(), 1);
        assert!(reader.count_matches());
        assert_eq!(reader.count(), 2);
    }
}
