// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::time::Instant;

/// Thresholds that close a batch. Whichever is reached first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_messages: usize,
    pub max_age: Duration,
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Count,
    Bytes,
    Time,
    Shutdown,
}

/// Encoded records waiting to be sent, in arrival order.
#[derive(Debug, Default)]
pub struct Batch {
    records: Vec<Vec<u8>>,
    bytes: usize,
    opened_at: Option<Instant>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// When the first record was admitted. `None` while the batch is empty.
    #[must_use]
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    pub fn admit(&mut self, record: Vec<u8>, now: Instant) {
        if self.opened_at.is_none() {
            self.opened_at = Some(now);
        }
        self.bytes += record.len();
        self.records.push(record);
    }

    /// Instant at which the open batch becomes due by age.
    #[must_use]
    pub fn deadline(&self, limits: &BatchLimits) -> Option<Instant> {
        self.opened_at.map(|opened| opened + limits.max_age)
    }

    #[must_use]
    pub fn due(&self, limits: &BatchLimits, now: Instant) -> Option<FlushTrigger> {
        if self.is_empty() {
            return None;
        }
        if self.records.len() >= limits.max_messages {
            return Some(FlushTrigger::Count);
        }
        if self.bytes >= limits.max_bytes {
            return Some(FlushTrigger::Bytes);
        }
        match self.deadline(limits) {
            Some(deadline) if now >= deadline => Some(FlushTrigger::Time),
            _ => None,
        }
    }

    /// Hands out the records and resets the batch.
    pub fn take(&mut self) -> Vec<Vec<u8>> {
        self.bytes = 0;
        self.opened_at = None;
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: BatchLimits = BatchLimits {
        max_messages: 3,
        max_age: Duration::from_millis(200),
        max_bytes: 100,
    };

    #[test]
    fn test_empty_batch_is_never_due() {
        let batch = Batch::new();
        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(batch.due(&LIMITS, later), None);
        assert_eq!(batch.deadline(&LIMITS), None);
    }

    #[test]
    fn test_first_admit_opens_batch() {
        let mut batch = Batch::new();
        let start = Instant::now();
        batch.admit(b"one".to_vec(), start);
        batch.admit(b"two".to_vec(), start + Duration::from_millis(50));
        assert_eq!(batch.opened_at(), Some(start));
        assert_eq!(batch.deadline(&LIMITS), Some(start + Duration::from_millis(200)));
        assert_eq!(batch.bytes(), 6);
    }

    #[test]
    fn test_count_trigger() {
        let mut batch = Batch::new();
        let now = Instant::now();
        batch.admit(b"a".to_vec(), now);
        batch.admit(b"b".to_vec(), now);
        assert_eq!(batch.due(&LIMITS, now), None);
        batch.admit(b"c".to_vec(), now);
        assert_eq!(batch.due(&LIMITS, now), Some(FlushTrigger::Count));
    }

    #[test]
    fn test_bytes_trigger_before_count() {
        let mut batch = Batch::new();
        let now = Instant::now();
        batch.admit(vec![b'x'; 60], now);
        assert_eq!(batch.due(&LIMITS, now), None);
        batch.admit(vec![b'y'; 60], now);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.due(&LIMITS, now), Some(FlushTrigger::Bytes));
    }

    #[test]
    fn test_time_trigger() {
        let mut batch = Batch::new();
        let now = Instant::now();
        batch.admit(b"lonely".to_vec(), now);
        assert_eq!(batch.due(&LIMITS, now + Duration::from_millis(199)), None);
        assert_eq!(
            batch.due(&LIMITS, now + Duration::from_millis(200)),
            Some(FlushTrigger::Time)
        );
    }

    #[test]
    fn test_take_resets() {
        let mut batch = Batch::new();
        let now = Instant::now();
        batch.admit(b"a".to_vec(), now);
        batch.admit(b"b".to_vec(), now);
        assert_eq!(batch.take(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(batch.is_empty());
        assert_eq!(batch.bytes(), 0);
        assert_eq!(batch.opened_at(), None);
    }
}
