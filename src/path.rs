//! Location paths into a message, e.g. `PID-3(2)-4-1` or `OBX[2]-5`.
//!
//! ```text
//! SEG[occurrence]-field(repetition)-component-subcomponent
//! ```
//! Every index is 1-based; only the segment code and field are mandatory.

use nom::{
    bytes::complete::take_while_m_n,
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt},
    sequence::{delimited, preceded, tuple},
    IResult,
};
use std::fmt;

use crate::HL7Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub segment: String,
    pub occurrence: usize,
    pub field: usize,
    pub repetition: usize,
    pub component: Option<usize>,
    pub subcomponent: Option<usize>,
}

impl Location {
    pub fn parse(path: &str) -> Result<Self, HL7Error> {
        let (_, (segment, occurrence, field, repetition, component)) =
            all_consuming(location)(path.trim())
                .map_err(|_| HL7Error::InvalidPath(path.to_string()))?;

        let (component, subcomponent) = match component {
            Some((c, s)) => (Some(c), s),
            None => (None, None),
        };
        let location = Self {
            segment: segment.to_string(),
            occurrence: occurrence.unwrap_or(1),
            field,
            repetition: repetition.unwrap_or(1),
            component,
            subcomponent,
        };

        let indices = [
            Some(location.occurrence),
            Some(location.field),
            Some(location.repetition),
            location.component,
            location.subcomponent,
        ];
        if indices.iter().flatten().any(|&n| n == 0) {
            return Err(HL7Error::InvalidPath(format!(
                "{} (indices start at 1)",
                path
            )));
        }
        Ok(location)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segment)?;
        if self.occurrence > 1 {
            write!(f, "[{}]", self.occurrence)?;
        }
        write!(f, "-{}", self.field)?;
        if self.repetition > 1 {
            write!(f, "({})", self.repetition)?;
        }
        if let Some(component) = self.component {
            write!(f, "-{}", component)?;
        }
        if let Some(subcomponent) = self.subcomponent {
            write!(f, "-{}", subcomponent)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Location {
    type Err = HL7Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn index(input: &str) -> IResult<&str, usize> {
    map_res(digit1, str::parse::<usize>)(input)
}

fn segment_code(input: &str) -> IResult<&str, &str> {
    take_while_m_n(3, 3, |c: char| c.is_ascii_uppercase() || c.is_ascii_digit())(input)
}

type Parts<'a> = (
    &'a str,
    Option<usize>,
    usize,
    Option<usize>,
    Option<(usize, Option<usize>)>,
);

fn location(input: &str) -> IResult<&str, Parts<'_>> {
    tuple((
        segment_code,
        opt(delimited(char('['), index, char(']'))),
        preceded(char('-'), index),
        opt(delimited(char('('), index, char(')'))),
        opt(tuple((
            preceded(char('-'), index),
            opt(preceded(char('-'), index)),
        ))),
    ))(input)
}
