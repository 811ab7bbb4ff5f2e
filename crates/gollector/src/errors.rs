// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Structural violations found while decomposing an RFC5424 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("message is not valid UTF-8")]
    InvalidUtf8,
    #[error("message does not start with a <PRI> field")]
    MissingPriority,
    #[error("malformed PRI field")]
    InvalidPriority,
    #[error("malformed VERSION field")]
    InvalidVersion,
    #[error("malformed TIMESTAMP field")]
    InvalidTimestamp,
    #[error("missing {0} field")]
    MissingField(&'static str),
    #[error("expected a space after the {0} field")]
    ExpectedSeparator(&'static str),
    #[error("malformed STRUCTURED-DATA element")]
    InvalidStructuredData,
    #[error("unterminated STRUCTURED-DATA element")]
    UnterminatedStructuredData,
}

/// Returned by a push on a closed queue. Hands the item back to the caller.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct QueueClosed<T>(pub T);

impl<T> fmt::Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueClosed(..)")
    }
}

impl<T> fmt::Display for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("handoff queue is closed")
    }
}

impl<T> std::error::Error for QueueClosed<T> {}

#[derive(Debug, thiserror::Error)]
#[error("failed to bind {transport} listener to {address}: {source}")]
pub struct BindError {
    pub transport: &'static str,
    pub address: String,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to connect to brokers {brokers}: {message}")]
    Connect { brokers: String, message: String },
    #[error("failed to create partition client for topic {topic}: {message}")]
    Topic { topic: String, message: String },
    #[error("failed to produce {records} records to topic {topic}: {message}")]
    Send {
        topic: String,
        records: usize,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatisticsError {
    #[error("statistics for {0} are unavailable")]
    Unavailable(String),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
