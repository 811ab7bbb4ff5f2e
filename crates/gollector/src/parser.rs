// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::StatisticsError;
use crate::message::{ParsedMessage, PassthroughReason, RawMessage};
use crate::queue::HandoffQueue;
use crate::rfc5424;
use crate::statistics::{Counter, StatisticsProvider, StatisticsSnapshot};

/// Whether headers are decomposed. Fixed for the lifetime of a parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserMode {
    Enabled,
    Disabled,
}

impl From<bool> for ParserMode {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

#[derive(Debug, Default)]
pub struct ParserStatistics {
    pub processed: Counter,
    pub parsed: Counter,
    pub parse_errors: Counter,
}

impl StatisticsProvider for ParserStatistics {
    fn statistics(&self) -> Result<StatisticsSnapshot, StatisticsError> {
        Ok(StatisticsSnapshot::new()
            .with("processed", &self.processed)
            .with("parsed", &self.parsed)
            .with("parse_errors", &self.parse_errors))
    }
}

/// Turns every raw message into exactly one parsed message.
pub struct HeaderParser {
    mode: ParserMode,
    statistics: Arc<ParserStatistics>,
}

impl HeaderParser {
    #[must_use]
    pub fn new(mode: ParserMode) -> Self {
        Self {
            mode,
            statistics: Arc::new(ParserStatistics::default()),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ParserMode {
        self.mode
    }

    #[must_use]
    pub fn statistics(&self) -> Arc<ParserStatistics> {
        Arc::clone(&self.statistics)
    }

    /// Classifies a single message. Malformed input becomes a passthrough, never an error.
    pub fn process(&self, raw: RawMessage) -> ParsedMessage {
        self.statistics.processed.incr();
        match self.mode {
            ParserMode::Disabled => ParsedMessage::Passthrough {
                raw,
                reason: PassthroughReason::Disabled,
            },
            ParserMode::Enabled => match rfc5424::parse_bytes(raw.payload()) {
                Ok(record) => {
                    self.statistics.parsed.incr();
                    ParsedMessage::Structured {
                        record,
                        origin: *raw.origin(),
                    }
                }
                Err(e) => {
                    self.statistics.parse_errors.incr();
                    debug!(
                        "parser: forwarding unparsed message from {}: {e}",
                        raw.origin().peer
                    );
                    ParsedMessage::Passthrough {
                        raw,
                        reason: PassthroughReason::Malformed(e),
                    }
                }
            },
        }
    }

    /// Drains `raw_queue` until it is closed and empty, then closes `parsed_queue`.
    pub async fn run(
        self,
        raw_queue: HandoffQueue<RawMessage>,
        parsed_queue: HandoffQueue<ParsedMessage>,
    ) {
        info!("parser: started, header parsing {:?}", self.mode);
        while let Some(raw) = raw_queue.pop().await {
            let parsed = self.process(raw);
            if parsed_queue.push(parsed).await.is_err() {
                debug!("parser: parsed queue closed, stopping");
                break;
            }
        }
        parsed_queue.close();
        info!("parser: stopped");
    }
}
