// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pull-based counters exposed by every pipeline stage.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::errors::StatisticsError;

/// Monotonic counter. Increments and reads never block.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn decr(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Point-in-time totals of one component, keyed by counter name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StatisticsSnapshot(BTreeMap<&'static str, u64>);

impl StatisticsSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: &'static str, counter: &Counter) -> Self {
        self.0.insert(name, counter.get());
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<u64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }
}

/// Implemented by each stage so the admin server can report on it.
pub trait StatisticsProvider: Send + Sync {
    fn statistics(&self) -> Result<StatisticsSnapshot, StatisticsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add_and_get() {
        let counter = Counter::new();
        counter.incr();
        counter.add(41);
        assert_eq!(counter.get(), 42);
        counter.decr();
        assert_eq!(counter.get(), 41);
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let messages = Counter::new();
        messages.add(3);
        let errors = Counter::new();
        let snapshot = StatisticsSnapshot::new()
            .with("messages", &messages)
            .with("errors", &errors);

        assert_eq!(snapshot.get("messages"), Some(3));
        assert_eq!(snapshot.get("missing"), None);
        assert_eq!(
            serde_json::to_string(&snapshot).expect("serialize"),
            r#"{"errors":0,"messages":3}"#
        );
    }

    fn read_twice(provider: &dyn StatisticsProvider) {
        let first = provider.statistics().expect("first read");
        let second = provider.statistics().expect("second read");
        assert_eq!(first, second);
    }

    #[test]
    fn test_stage_reads_are_idempotent() {
        let tcp = crate::tcp::TcpStatistics::default();
        tcp.connections.add(2);
        tcp.messages.add(7);
        read_twice(&tcp);

        let udp = crate::udp::UdpStatistics::default();
        udp.oversized.incr();
        read_twice(&udp);

        let parser = crate::parser::ParserStatistics::default();
        parser.processed.add(4);
        parser.parse_errors.incr();
        read_twice(&parser);

        let producer = crate::producer::ProducerStatistics::default();
        producer.batches_flushed.add(3);
        producer.bytes_sent.add(512);
        read_twice(&producer);

        assert_eq!(producer.statistics().expect("read").get("bytes_sent"), Some(512));
    }
}
