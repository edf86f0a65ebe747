use nom::{
    bytes::complete::{take_till, take_while_m_n},
    character::complete::anychar,
    sequence::tuple,
    IResult,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::HL7Error;

/// Segments whose first two fields declare the delimiters instead of carrying data.
pub const HEADER_SEGMENTS: [&str; 3] = ["MSH", "BHS", "FHS"];

/// The structural characters of one HL7 message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub subcomponent: char,
    pub repetition: char,
    pub escape: char,
    /// Fifth encoding character introduced in v2.7
    pub truncation: Option<char>,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            subcomponent: '&',
            repetition: '~',
            escape: '\\',
            truncation: None,
        }
    }
}

impl Delimiters {
    /// The MSH-2 value for these delimiters, in standard order.
    pub fn encoding_characters(&self) -> String {
        let mut chars = String::with_capacity(5);
        chars.push(self.component);
        chars.push(self.repetition);
        chars.push(self.escape);
        chars.push(self.subcomponent);
        if let Some(truncation) = self.truncation {
            chars.push(truncation);
        }
        chars
    }

    /// True for the four separators; the escape character is not structural.
    pub fn is_structural(&self, c: char) -> bool {
        c == self.field || c == self.component || c == self.repetition || c == self.subcomponent
    }

    /// Derive the delimiters from the first segment of `raw`.
    ///
    /// `allow_default_encoding` enables the `^~\&` fallback for senders that leave
    /// MSH-2 empty.
    pub fn resolve(raw: &str, allow_default_encoding: bool) -> Result<Self, HL7Error> {
        let first = raw
            .trim_start_matches(|c: char| c == '\r' || c == '\n')
            .split(|c: char| c == '\r' || c == '\n')
            .next()
            .unwrap_or_default();

        let (_, (code, field, encoding)) = header(first).map_err(|_| {
            HL7Error::MalformedHeader(format!(
                "expected a three character segment code followed by a field separator, got '{}'",
                first.chars().take(8).collect::<String>()
            ))
        })?;

        if !is_valid_separator(field) {
            return Err(HL7Error::MalformedHeader(format!(
                "'{}' cannot be used as a field separator",
                field.escape_default()
            )));
        }

        let encoding: Vec<char> = encoding.chars().collect();
        let delimiters = match encoding.len() {
            0 if allow_default_encoding => {
                debug!(code, "Encoding characters missing, using defaults");
                Self {
                    field,
                    ..Self::default()
                }
            }
            0 => {
                return Err(HL7Error::MalformedHeader(format!(
                    "{}-2 encoding characters are missing",
                    code
                )))
            }
            4 | 5 => Self {
                field,
                component: encoding[0],
                repetition: encoding[1],
                escape: encoding[2],
                subcomponent: encoding[3],
                truncation: encoding.get(4).copied(),
            },
            n => {
                return Err(HL7Error::MalformedHeader(format!(
                    "{}-2 must hold 4 encoding characters, found {}",
                    code, n
                )))
            }
        };

        delimiters.check_distinct()?;
        debug!(
            code,
            field = %delimiters.field,
            encoding = %delimiters.encoding_characters(),
            "Resolved message delimiters"
        );
        Ok(delimiters)
    }

    fn check_distinct(&self) -> Result<(), HL7Error> {
        let mut all = vec![
            self.field,
            self.component,
            self.repetition,
            self.escape,
            self.subcomponent,
        ];
        all.extend(self.truncation);

        if let Some(bad) = all.iter().find(|&&c| !is_valid_separator(c)) {
            return Err(HL7Error::MalformedHeader(format!(
                "'{}' cannot be used as a delimiter",
                bad.escape_default()
            )));
        }
        for (i, c) in all.iter().enumerate() {
            if all[i + 1..].contains(c) {
                return Err(HL7Error::MalformedHeader(format!(
                    "delimiter '{}' is declared twice",
                    c
                )));
            }
        }
        Ok(())
    }
}

fn is_valid_separator(c: char) -> bool {
    !c.is_alphanumeric() && !c.is_whitespace() && !c.is_control()
}

fn segment_code(input: &str) -> IResult<&str, &str> {
    take_while_m_n(3, 3, |c: char| c.is_ascii_uppercase() || c.is_ascii_digit())(input)
}

/// `XXX` `<field separator>` `<encoding characters up to the next separator>`
fn header(input: &str) -> IResult<&str, (&str, char, &str)> {
    let (rest, (code, field)) = tuple((segment_code, anychar))(input)?;
    let (rest, encoding) = take_till(move |c: char| c == field)(rest)?;
    Ok((rest, (code, field, encoding)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_header() {
        let d = Delimiters::resolve("MSH|^~\\&|APP|FAC\rPID|1", false).unwrap();
        assert_eq!(d, Delimiters::default());
        assert_eq!(d.encoding_characters(), "^~\\&");
    }

    #[test]
    fn test_custom_delimiters() {
        let d = Delimiters::resolve("MSH#$*@!#APP", false).unwrap();
        assert_eq!(d.field, '#');
        assert_eq!(d.component, '$');
        assert_eq!(d.repetition, '*');
        assert_eq!(d.escape, '@');
        assert_eq!(d.subcomponent, '!');
        assert_eq!(d.truncation, None);
    }

    #[test]
    fn test_truncation_character() {
        let d = Delimiters::resolve("MSH|^~\\&#|APP", false).unwrap();
        assert_eq!(d.truncation, Some('#'));
        assert_eq!(d.encoding_characters(), "^~\\&#");
    }

    #[test]
    fn test_batch_header_resolves() {
        let d = Delimiters::resolve("BHS|^~\\&|LAB", false).unwrap();
        assert_eq!(d, Delimiters::default());
    }

    #[test]
    fn test_missing_encoding_characters_fallback() {
        let d = Delimiters::resolve("MSH||APP|FAC", true).unwrap();
        assert_eq!(d, Delimiters::default());

        assert!(matches!(
            Delimiters::resolve("MSH||APP|FAC", false),
            Err(HL7Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_short_encoding_characters() {
        assert!(matches!(
            Delimiters::resolve("MSH|^~|APP", true),
            Err(HL7Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_bad_segment_code() {
        for raw in ["MS|^~\\&", "msh|^~\\&", "", "MSH"] {
            assert!(
                matches!(
                    Delimiters::resolve(raw, true),
                    Err(HL7Error::MalformedHeader(_))
                ),
                "accepted {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_alphanumeric_field_separator_rejected() {
        assert!(matches!(
            Delimiters::resolve("MSHA^~\\&A", true),
            Err(HL7Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_duplicate_delimiters_rejected() {
        assert!(matches!(
            Delimiters::resolve("MSH|^^\\&|", true),
            Err(HL7Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_leading_blank_lines_ignored() {
        let d = Delimiters::resolve("\r\nMSH|^~\\&|APP", false).unwrap();
        assert_eq!(d.field, '|');
    }
}
