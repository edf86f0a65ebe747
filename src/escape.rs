//! Escape sequence handling for leaf values.
//!
//! Delimiter escapes (`\F\ \S\ \T\ \R\ \E\ \P\`) and hex data (`\Xhh..\`) are
//! decoded into plain text. Formatting commands (`\H\`, `\N\`, `\.br\`, `\Cxxyy\`,
//! `\Mxxyyzz\`, `\Z..\`) are kept verbatim in the decoded value and written back
//! unescaped by [`escape`], so they survive a decode/encode cycle untouched.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, char, digit1, hex_digit1, one_of},
    combinator::{all_consuming, opt, recognize, rest},
    sequence::{pair, preceded},
    IResult,
};
use std::borrow::Cow;
use thiserror::Error;

use crate::delimiters::Delimiters;

/// A malformed escape sequence found in a leaf value. The raw text is kept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscapeSequenceError {
    #[error("unterminated escape sequence '{0}'")]
    Unterminated(String),

    #[error("unknown escape sequence '{0}'")]
    Unknown(String),

    #[error("invalid hex escape sequence '{0}'")]
    InvalidHex(String),
}

enum Decoded {
    Char(char),
    Text(String),
    Verbatim,
}

/// Decode every escape sequence in `raw`.
///
/// Malformed sequences are copied through unchanged and reported back.
pub fn unescape<'a>(
    raw: &'a str,
    delimiters: &Delimiters,
) -> (Cow<'a, str>, Vec<EscapeSequenceError>) {
    let esc = delimiters.escape;
    if !raw.contains(esc) {
        return (Cow::Borrowed(raw), Vec::new());
    }

    let esc_len = esc.len_utf8();
    let mut out = String::with_capacity(raw.len());
    let mut errors = Vec::new();
    let mut rest = raw;

    while let Some(start) = rest.find(esc) {
        out.push_str(&rest[..start]);
        let after = &rest[start + esc_len..];

        let Some(end) = after.find(esc) else {
            errors.push(EscapeSequenceError::Unterminated(rest[start..].to_string()));
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };

        let body = &after[..end];
        let sequence = &rest[start..start + esc_len + end + esc_len];
        match decode_body(body, delimiters) {
            Ok(Decoded::Char(c)) => out.push(c),
            Ok(Decoded::Text(text)) => out.push_str(&text),
            Ok(Decoded::Verbatim) => out.push_str(sequence),
            Err(e) => {
                errors.push(e);
                out.push_str(sequence);
            }
        }
        rest = &after[end + esc_len..];
    }
    out.push_str(rest);

    (Cow::Owned(out), errors)
}

/// Escape delimiter characters in `value` so it can be written as a leaf.
pub fn escape<'a>(value: &'a str, delimiters: &Delimiters) -> Cow<'a, str> {
    let needs_escape = value.chars().any(|c| {
        delimiters.is_structural(c)
            || c == delimiters.escape
            || c == '\r'
            || c == '\n'
            || Some(c) == delimiters.truncation
    });
    if !needs_escape {
        return Cow::Borrowed(value);
    }

    let esc = delimiters.escape;
    let mut out = String::with_capacity(value.len() + 8);
    let mut skip_to = 0;

    for (i, c) in value.char_indices() {
        if i < skip_to {
            continue;
        }
        if c == esc {
            if let Some(len) = formatting_span(&value[i..], delimiters) {
                out.push_str(&value[i..i + len]);
                skip_to = i + len;
                continue;
            }
        }

        let code = match c {
            c if c == delimiters.field => Some('F'),
            c if c == delimiters.component => Some('S'),
            c if c == delimiters.subcomponent => Some('T'),
            c if c == delimiters.repetition => Some('R'),
            c if c == esc => Some('E'),
            c if Some(c) == delimiters.truncation => Some('P'),
            _ => None,
        };
        match (code, c) {
            (Some(code), _) => {
                out.push(esc);
                out.push(code);
                out.push(esc);
            }
            (None, '\r') => push_hex(&mut out, esc, "0D"),
            (None, '\n') => push_hex(&mut out, esc, "0A"),
            (None, c) => out.push(c),
        }
    }

    Cow::Owned(out)
}

fn push_hex(out: &mut String, esc: char, hex: &str) {
    out.push(esc);
    out.push('X');
    out.push_str(hex);
    out.push(esc);
}

/// Byte length of a formatting sequence at the start of `value`, if there is one.
fn formatting_span(value: &str, delimiters: &Delimiters) -> Option<usize> {
    let esc = delimiters.escape;
    let after = &value[esc.len_utf8()..];
    let end = after.find(esc)?;
    let body = &after[..end];
    if body
        .chars()
        .any(|c| delimiters.is_structural(c) || c == '\r' || c == '\n')
    {
        return None;
    }
    if all_consuming(formatting)(body).is_ok() {
        Some(esc.len_utf8() * 2 + end)
    } else {
        None
    }
}

fn decode_body(body: &str, delimiters: &Delimiters) -> Result<Decoded, EscapeSequenceError> {
    let sequence = || format!("{esc}{body}{esc}", esc = delimiters.escape);

    match body {
        "F" => return Ok(Decoded::Char(delimiters.field)),
        "S" => return Ok(Decoded::Char(delimiters.component)),
        "T" => return Ok(Decoded::Char(delimiters.subcomponent)),
        "R" => return Ok(Decoded::Char(delimiters.repetition)),
        "E" => return Ok(Decoded::Char(delimiters.escape)),
        "P" => {
            return delimiters
                .truncation
                .map(Decoded::Char)
                .ok_or_else(|| EscapeSequenceError::Unknown(sequence()))
        }
        _ => {}
    }

    if let Some(hex) = body.strip_prefix('X') {
        return decode_hex(hex)
            .map(Decoded::Text)
            .ok_or_else(|| EscapeSequenceError::InvalidHex(sequence()));
    }

    if all_consuming(formatting)(body).is_ok() {
        return Ok(Decoded::Verbatim);
    }

    Err(EscapeSequenceError::Unknown(sequence()))
}

fn decode_hex(hex: &str) -> Option<String> {
    let (rest, digits) = hex_digit1::<_, nom::error::Error<&str>>(hex).ok()?;
    if !rest.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Text formatting and character set commands passed through to the receiver.
fn formatting(input: &str) -> IResult<&str, &str> {
    recognize(alt((
        tag("H"),
        tag("N"),
        recognize(preceded(
            char('.'),
            pair(alpha1, opt(pair(opt(one_of("+-")), digit1))),
        )),
        preceded(char('C'), hex_digit1),
        preceded(char('M'), hex_digit1),
        preceded(char('Z'), rest),
    )))(input)
}
