// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! RFC5424 header decomposition.
//!
//! ```text
//! SYSLOG-MSG = <PRI>VERSION SP TIMESTAMP SP HOSTNAME SP APP-NAME SP PROCID SP MSGID SP
//!              STRUCTURED-DATA [SP MSG]
//! ```
//!
//! The parser walks the input once, left to right. Every index is checked against the input
//! length, so arbitrary bytes produce a [`ParseError`] and never a panic.

use chrono::DateTime;

use crate::errors::ParseError;
use crate::message::{SdParam, StructuredElement, StructuredRecord};

const NILVALUE: &str = "-";
const MAX_PRIORITY: u16 = 191;
const UTF8_BOM: char = '\u{feff}';

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consumes bytes while `accept` holds. `accept` must reject only ASCII bytes, so the
    /// returned slice always ends on a char boundary.
    fn take_while(&mut self, accept: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if !accept(b) {
                break;
            }
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    fn rest(&mut self) -> &'a str {
        let rest = &self.input[self.pos..];
        self.pos = self.input.len();
        rest
    }
}

/// Decomposes one RFC5424 message as received off the wire. Input that is not UTF-8 is
/// rejected rather than repaired.
pub fn parse_bytes(input: &[u8]) -> Result<StructuredRecord, ParseError> {
    let input = std::str::from_utf8(input).map_err(|_| ParseError::InvalidUtf8)?;
    parse(input)
}

/// Decomposes one RFC5424 message.
pub fn parse(input: &str) -> Result<StructuredRecord, ParseError> {
    let mut cursor = Cursor::new(input);

    let priority = parse_priority(&mut cursor)?;
    let version = parse_version(&mut cursor)?;
    separator(&mut cursor, "VERSION")?;

    let timestamp = match header_field(&mut cursor, "TIMESTAMP")? {
        None => None,
        Some(ts) => Some(
            DateTime::parse_from_rfc3339(ts).map_err(|_| ParseError::InvalidTimestamp)?,
        ),
    };
    separator(&mut cursor, "TIMESTAMP")?;
    let hostname = header_field(&mut cursor, "HOSTNAME")?;
    separator(&mut cursor, "HOSTNAME")?;
    let app_name = header_field(&mut cursor, "APP-NAME")?;
    separator(&mut cursor, "APP-NAME")?;
    let proc_id = header_field(&mut cursor, "PROCID")?;
    separator(&mut cursor, "PROCID")?;
    let msg_id = header_field(&mut cursor, "MSGID")?;
    separator(&mut cursor, "MSGID")?;

    let structured_data = parse_structured_data(&mut cursor)?;

    let message = if cursor.is_eof() {
        None
    } else {
        separator(&mut cursor, "STRUCTURED-DATA")?;
        let body = cursor.rest();
        Some(body.strip_prefix(UTF8_BOM).unwrap_or(body).to_string())
    };

    Ok(StructuredRecord {
        priority,
        facility: priority / 8,
        severity: priority % 8,
        version,
        timestamp,
        hostname: hostname.map(str::to_string),
        app_name: app_name.map(str::to_string),
        proc_id: proc_id.map(str::to_string),
        msg_id: msg_id.map(str::to_string),
        structured_data,
        message,
    })
}

fn parse_priority(cursor: &mut Cursor<'_>) -> Result<u8, ParseError> {
    if !cursor.eat(b'<') {
        return Err(ParseError::MissingPriority);
    }
    let digits = cursor.take_while(|b| b.is_ascii_digit());
    if digits.is_empty() || digits.len() > 3 || !cursor.eat(b'>') {
        return Err(ParseError::InvalidPriority);
    }
    match digits.parse::<u16>() {
        Ok(pri) if pri <= MAX_PRIORITY => {
            u8::try_from(pri).map_err(|_| ParseError::InvalidPriority)
        }
        _ => Err(ParseError::InvalidPriority),
    }
}

fn parse_version(cursor: &mut Cursor<'_>) -> Result<u8, ParseError> {
    let digits = cursor.take_while(|b| b.is_ascii_digit());
    if digits.is_empty() || digits.len() > 2 || digits.starts_with('0') {
        return Err(ParseError::InvalidVersion);
    }
    digits.parse().map_err(|_| ParseError::InvalidVersion)
}

fn separator(cursor: &mut Cursor<'_>, after: &'static str) -> Result<(), ParseError> {
    if cursor.eat(b' ') {
        Ok(())
    } else {
        Err(ParseError::ExpectedSeparator(after))
    }
}

/// Reads a space-delimited header field. `Ok(None)` is the NILVALUE.
fn header_field<'a>(
    cursor: &mut Cursor<'a>,
    name: &'static str,
) -> Result<Option<&'a str>, ParseError> {
    let value = cursor.take_while(|b| b != b' ');
    match value {
        "" => Err(ParseError::MissingField(name)),
        NILVALUE => Ok(None),
        value => Ok(Some(value)),
    }
}

fn parse_structured_data(cursor: &mut Cursor<'_>) -> Result<Vec<StructuredElement>, ParseError> {
    match cursor.peek() {
        None => Err(ParseError::MissingField("STRUCTURED-DATA")),
        Some(b'-') => {
            cursor.pos += 1;
            Ok(Vec::new())
        }
        Some(b'[') => {
            let mut elements = Vec::new();
            while cursor.peek() == Some(b'[') {
                elements.push(parse_element(cursor)?);
            }
            Ok(elements)
        }
        Some(_) => Err(ParseError::InvalidStructuredData),
    }
}

fn is_sd_name(b: u8) -> bool {
    !matches!(b, b' ' | b']' | b'=' | b'"') && !b.is_ascii_control()
}

fn parse_element(cursor: &mut Cursor<'_>) -> Result<StructuredElement, ParseError> {
    cursor.pos += 1; // '['
    let id = cursor.take_while(is_sd_name);
    if id.is_empty() {
        return Err(unterminated_or(cursor, ParseError::InvalidStructuredData));
    }

    let mut params = Vec::new();
    loop {
        match cursor.peek() {
            None => return Err(ParseError::UnterminatedStructuredData),
            Some(b']') => {
                cursor.pos += 1;
                break;
            }
            Some(b' ') => {
                cursor.pos += 1;
                params.push(parse_param(cursor)?);
            }
            Some(_) => return Err(ParseError::InvalidStructuredData),
        }
    }

    Ok(StructuredElement {
        id: id.to_string(),
        params,
    })
}

fn parse_param(cursor: &mut Cursor<'_>) -> Result<SdParam, ParseError> {
    let name = cursor.take_while(is_sd_name);
    if name.is_empty() {
        return Err(unterminated_or(cursor, ParseError::InvalidStructuredData));
    }
    if !cursor.eat(b'=') || !cursor.eat(b'"') {
        return Err(unterminated_or(cursor, ParseError::InvalidStructuredData));
    }

    let bytes = cursor.input.as_bytes();
    let mut value = String::new();
    let mut start = cursor.pos;
    let mut i = cursor.pos;
    while let Some(&b) = bytes.get(i) {
        match b {
            b'"' => {
                value.push_str(&cursor.input[start..i]);
                cursor.pos = i + 1;
                return Ok(SdParam {
                    name: name.to_string(),
                    value,
                });
            }
            b'\\' => match bytes.get(i + 1) {
                Some(&escaped @ (b'"' | b'\\' | b']')) => {
                    value.push_str(&cursor.input[start..i]);
                    value.push(char::from(escaped));
                    i += 2;
                    start = i;
                }
                // any other backslash is kept as is
                _ => i += 1,
            },
            _ => i += 1,
        }
    }
    Err(ParseError::UnterminatedStructuredData)
}

fn unterminated_or(cursor: &Cursor<'_>, err: ParseError) -> ParseError {
    if cursor.is_eof() {
        ParseError::UnterminatedStructuredData
    } else {
        err
    }
}
