//! Interface-level line-protocol point value.
//!
//! The full parser/serializer lives outside this crate; the hinted-handoff
//! envelope only needs a validated single-line value and a newline-delimited
//! batch decoder.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("point is empty")]
    Empty,
    #[error("point contains an embedded newline")]
    EmbeddedNewline,
    #[error("point payload is not valid utf-8")]
    InvalidUtf8,
}

/// One line-protocol point, held as its textual form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    line: String,
}

impl Point {
    pub fn parse(line: &str) -> Result<Self, LineError> {
        if line.is_empty() {
            return Err(LineError::Empty);
        }
        if line.contains('\n') {
            return Err(LineError::EmbeddedNewline);
        }
        Ok(Self {
            line: line.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.line
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

/// Decode a newline-delimited batch of points. Blank lines are skipped.
pub fn parse_points(payload: &[u8]) -> Result<Vec<Point>, LineError> {
    let text = std::str::from_utf8(payload).map_err(|_| LineError::InvalidUtf8)?;
    text.lines()
        .filter(|line| !line.is_empty())
        .map(Point::parse)
        .collect()
}
