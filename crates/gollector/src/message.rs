// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message records handed between pipeline stages.

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::errors::ParseError;

/// Transport a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Where and when a message was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub transport: Transport,
    pub peer: SocketAddr,
    pub received_at: DateTime<Utc>,
}

/// One syslog message exactly as a listener delivered it. The payload bytes are never altered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    payload: Vec<u8>,
    origin: Origin,
}

impl RawMessage {
    #[must_use]
    pub fn new(payload: impl Into<Vec<u8>>, transport: Transport, peer: SocketAddr) -> Self {
        Self {
            payload: payload.into(),
            origin: Origin {
                transport,
                peer,
                received_at: Utc::now(),
            },
        }
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload for logging, with invalid UTF-8 replaced.
    #[must_use]
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    #[must_use]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SdParam {
    pub name: String,
    pub value: String,
}

/// A `[SD-ID name="value" ...]` block. Values are stored unescaped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuredElement {
    pub id: String,
    pub params: Vec<SdParam>,
}

/// A decomposed RFC5424 header and body. `None` fields were the NILVALUE `-` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuredRecord {
    pub priority: u8,
    pub facility: u8,
    pub severity: u8,
    pub version: u8,
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub hostname: Option<String>,
    pub app_name: Option<String>,
    pub proc_id: Option<String>,
    pub msg_id: Option<String>,
    pub structured_data: Vec<StructuredElement>,
    pub message: Option<String>,
}

fn write_field(f: &mut fmt::Formatter<'_>, value: Option<&str>) -> fmt::Result {
    f.write_str(value.unwrap_or("-"))
}

fn write_escaped(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    for ch in value.chars() {
        if matches!(ch, '"' | '\\' | ']') {
            f.write_str("\\")?;
        }
        write!(f, "{ch}")?;
    }
    Ok(())
}

/// Renders the record back into RFC5424 text.
impl fmt::Display for StructuredRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>{} ", self.priority, self.version)?;
        match &self.timestamp {
            Some(ts) => f.write_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))?,
            None => f.write_str("-")?,
        }
        f.write_str(" ")?;
        write_field(f, self.hostname.as_deref())?;
        f.write_str(" ")?;
        write_field(f, self.app_name.as_deref())?;
        f.write_str(" ")?;
        write_field(f, self.proc_id.as_deref())?;
        f.write_str(" ")?;
        write_field(f, self.msg_id.as_deref())?;
        f.write_str(" ")?;
        if self.structured_data.is_empty() {
            f.write_str("-")?;
        }
        for element in &self.structured_data {
            write!(f, "[{}", element.id)?;
            for param in &element.params {
                write!(f, " {}=\"", param.name)?;
                write_escaped(f, &param.value)?;
                f.write_str("\"")?;
            }
            f.write_str("]")?;
        }
        if let Some(message) = &self.message {
            write!(f, " {message}")?;
        }
        Ok(())
    }
}

/// Why a message was forwarded without decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    /// Header parsing is turned off.
    Disabled,
    Malformed(ParseError),
}

impl fmt::Display for PassthroughReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("parsing disabled"),
            Self::Malformed(err) => write!(f, "{err}"),
        }
    }
}

/// Output of the header parser. Every raw message yields exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedMessage {
    Structured {
        record: StructuredRecord,
        origin: Origin,
    },
    Passthrough {
        raw: RawMessage,
        reason: PassthroughReason,
    },
}

impl ParsedMessage {
    #[must_use]
    pub fn origin(&self) -> &Origin {
        match self {
            Self::Structured { origin, .. } => origin,
            Self::Passthrough { raw, .. } => raw.origin(),
        }
    }

    #[must_use]
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Structured { .. })
    }

    /// Serializes the message into the value of a broker record.
    ///
    /// Passthrough messages are always sent as their original bytes.
    #[must_use]
    pub fn to_wire(&self, format: WireFormat) -> Vec<u8> {
        match (self, format) {
            (Self::Passthrough { raw, .. }, _) => raw.payload().to_vec(),
            (Self::Structured { record, .. }, WireFormat::Rfc5424) => {
                record.to_string().into_bytes()
            }
            (Self::Structured { record, .. }, WireFormat::Json) => {
                match serde_json::to_vec(record) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!("Failed to encode record as JSON, sending RFC5424 text: {e}");
                        record.to_string().into_bytes()
                    }
                }
            }
        }
    }
}

/// Encoding of structured records on the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    #[default]
    Json,
    Rfc5424,
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "rfc5424" => Ok(Self::Rfc5424),
            other => Err(format!("unknown wire format '{other}', expected json or rfc5424")),
        }
    }
}
