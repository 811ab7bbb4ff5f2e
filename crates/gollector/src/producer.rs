// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching producer.
//!
//! Two tasks share the open batch. The drain task admits parsed messages and flushes when the
//! batch is full by count or size. The timer task sleeps until the open batch reaches its
//! maximum age and flushes it then, so an idle pipeline still delivers within the time limit.
//! Each evaluate, flush and reset happens under the batch lock, so a batch is flushed exactly
//! once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, BatchLimits, FlushTrigger};
use crate::broker::{Broker, RetryPolicy};
use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_BUFFER_BYTES, DEFAULT_MAX_BUFFER_TIME_MS, DEFAULT_TOPIC,
};
use crate::errors::StatisticsError;
use crate::message::{ParsedMessage, WireFormat};
use crate::queue::HandoffQueue;
use crate::statistics::{Counter, StatisticsProvider, StatisticsSnapshot};

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub topic: String,
    pub batch_size: usize,
    pub max_buffer_time: Duration,
    pub max_buffer_bytes: usize,
    pub retry: RetryPolicy,
    pub wire_format: WireFormat,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_buffer_time: Duration::from_millis(DEFAULT_MAX_BUFFER_TIME_MS),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            retry: RetryPolicy::default(),
            wire_format: WireFormat::default(),
        }
    }
}

impl ProducerConfig {
    fn limits(&self) -> BatchLimits {
        BatchLimits {
            max_messages: self.batch_size,
            max_age: self.max_buffer_time,
            max_bytes: self.max_buffer_bytes,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProducerStatistics {
    pub messages_sent: Counter,
    pub batches_flushed: Counter,
    pub send_failures: Counter,
    pub bytes_sent: Counter,
    pub messages_dropped: Counter,
    pub retries: Counter,
}

impl StatisticsProvider for ProducerStatistics {
    fn statistics(&self) -> Result<StatisticsSnapshot, StatisticsError> {
        Ok(StatisticsSnapshot::new()
            .with("messages_sent", &self.messages_sent)
            .with("batches_flushed", &self.batches_flushed)
            .with("send_failures", &self.send_failures)
            .with("bytes_sent", &self.bytes_sent)
            .with("messages_dropped", &self.messages_dropped)
            .with("retries", &self.retries))
    }
}

pub struct BatchProducer {
    config: ProducerConfig,
    limits: BatchLimits,
    broker: Arc<dyn Broker>,
    statistics: Arc<ProducerStatistics>,
    batch: Mutex<Batch>,
    // Signalled when the first record enters an empty batch.
    opened: Notify,
}

impl BatchProducer {
    #[must_use]
    pub fn new(config: ProducerConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            limits: config.limits(),
            config,
            broker,
            statistics: Arc::new(ProducerStatistics::default()),
            batch: Mutex::new(Batch::new()),
            opened: Notify::new(),
        }
    }

    #[must_use]
    pub fn statistics(&self) -> Arc<ProducerStatistics> {
        Arc::clone(&self.statistics)
    }

    /// Consumes parsed messages until the queue is closed and drained, then flushes whatever
    /// is left in the open batch.
    pub async fn run(self, parsed_queue: HandoffQueue<ParsedMessage>) {
        info!(
            "producer: started for topic {}, batch size {}, max buffer time {:?}, max buffer bytes {}",
            self.config.topic, self.limits.max_messages, self.limits.max_age, self.limits.max_bytes
        );
        let producer = Arc::new(self);
        let stop_timer = CancellationToken::new();
        let timer = tokio::spawn(Arc::clone(&producer).flush_on_age(stop_timer.clone()));

        while let Some(message) = parsed_queue.pop().await {
            producer.admit(&message).await;
        }

        stop_timer.cancel();
        if let Err(e) = timer.await {
            error!("producer: flush timer failed: {e}");
        }

        let mut batch = producer.batch.lock().await;
        if !batch.is_empty() {
            producer.flush(&mut batch, FlushTrigger::Shutdown).await;
        }
        info!("producer: stopped");
    }

    async fn admit(&self, message: &ParsedMessage) {
        let record = message.to_wire(self.config.wire_format);
        let mut batch = self.batch.lock().await;
        let now = Instant::now();
        let was_empty = batch.is_empty();
        batch.admit(record, now);
        if was_empty {
            self.opened.notify_one();
        }
        if let Some(trigger) = batch.due(&self.limits, now) {
            self.flush(&mut batch, trigger).await;
        }
    }

    async fn flush_on_age(self: Arc<Self>, stop: CancellationToken) {
        loop {
            let deadline = self.batch.lock().await.deadline(&self.limits);
            match deadline {
                None => {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = self.opened.notified() => {},
                    }
                }
                Some(deadline) => {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = sleep_until(deadline) => {
                            let mut batch = self.batch.lock().await;
                            if let Some(trigger) = batch.due(&self.limits, Instant::now()) {
                                self.flush(&mut batch, trigger).await;
                            }
                        },
                    }
                }
            }
        }
    }

    /// Sends the batch, retrying per the configured policy. The batch is empty afterwards
    /// whether or not the send succeeded.
    async fn flush(&self, batch: &mut Batch, trigger: FlushTrigger) {
        let bytes = batch.bytes() as u64;
        let records = batch.take();
        let count = records.len() as u64;
        self.statistics.batches_flushed.incr();

        let mut attempt = 0;
        loop {
            match self.broker.send(&self.config.topic, &records).await {
                Ok(()) => {
                    self.statistics.messages_sent.add(count);
                    self.statistics.bytes_sent.add(bytes);
                    debug!(
                        "producer: flushed {count} messages ({bytes} bytes) to {} on {trigger:?}",
                        self.config.topic
                    );
                    return;
                }
                Err(e) if attempt < self.config.retry.max_retries => {
                    attempt += 1;
                    self.statistics.retries.incr();
                    let delay = self.config.retry.backoff(attempt);
                    warn!("producer: {e}, retry {attempt} in {delay:?}");
                    sleep(delay).await;
                }
                Err(e) => {
                    self.statistics.send_failures.incr();
                    self.statistics.messages_dropped.add(count);
                    error!("producer: dropping batch of {count} messages: {e}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::BrokerError;
    use crate::message::{PassthroughReason, RawMessage, Transport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::timeout;

    #[derive(Default)]
    struct RecordingBroker {
        sent: std::sync::Mutex<Vec<(Instant, Vec<Vec<u8>>)>>,
        failures_left: AtomicU32,
    }

    impl RecordingBroker {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(times),
                ..Default::default()
            }
        }

        fn batches(&self) -> Vec<Vec<Vec<u8>>> {
            self.sent.lock().unwrap().iter().map(|(_, b)| b.clone()).collect()
        }

        async fn wait_for_batches(&self, n: usize) {
            timeout(Duration::from_secs(3), async {
                while self.sent.lock().unwrap().len() < n {
                    sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        async fn send(&self, topic: &str, records: &[Vec<u8>]) -> Result<(), BrokerError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(BrokerError::Send {
                    topic: topic.to_string(),
                    records: records.len(),
                    message: "broker unavailable".to_string(),
                });
            }
            self.sent.lock().unwrap().push((Instant::now(), records.to_vec()));
            Ok(())
        }
    }

    fn message(payload: &str) -> ParsedMessage {
        let peer = "127.0.0.1:5140".parse().unwrap();
        ParsedMessage::Passthrough {
            raw: RawMessage::new(payload, Transport::Tcp, peer),
            reason: PassthroughReason::Disabled,
        }
    }

    fn config(batch_size: usize, max_time_ms: u64, max_bytes: usize) -> ProducerConfig {
        ProducerConfig {
            topic: "logs".to_string(),
            batch_size,
            max_buffer_time: Duration::from_millis(max_time_ms),
            max_buffer_bytes: max_bytes,
            ..Default::default()
        }
    }

    fn start(
        config: ProducerConfig,
        broker: Arc<RecordingBroker>,
    ) -> (HandoffQueue<ParsedMessage>, Arc<ProducerStatistics>, tokio::task::JoinHandle<()>) {
        let producer = BatchProducer::new(config, broker);
        let statistics = producer.statistics();
        let queue = HandoffQueue::new(0);
        let task = tokio::spawn(producer.run(queue.clone()));
        (queue, statistics, task)
    }

    #[tokio::test]
    async fn test_count_trigger_flushes_once() {
        let broker = Arc::new(RecordingBroker::default());
        let (queue, statistics, task) = start(config(3, 10_000, 1 << 20), Arc::clone(&broker));

        for payload in ["a", "b", "c"] {
            queue.push(message(payload)).await.unwrap();
        }
        broker.wait_for_batches(1).await;
        queue.close();
        task.await.unwrap();

        assert_eq!(
            broker.batches(),
            vec![vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]]
        );
        assert_eq!(statistics.batches_flushed.get(), 1);
        assert_eq!(statistics.messages_sent.get(), 3);
        assert_eq!(statistics.bytes_sent.get(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_count_and_time_triggers_never_share_a_batch() {
        use proptest::strategy::{Strategy, ValueTree};
        use proptest::test_runner::TestRunner;

        let broker = Arc::new(RecordingBroker::default());
        let (queue, statistics, task) = start(config(2, 1, 1 << 20), Arc::clone(&broker));
        let gaps = proptest::collection::vec(0u8..4, 300)
            .new_tree(&mut TestRunner::deterministic())
            .unwrap()
            .current();

        let mut pushed = Vec::with_capacity(gaps.len());
        for (i, gap) in gaps.into_iter().enumerate() {
            let payload = i.to_string();
            queue.push(message(&payload)).await.unwrap();
            pushed.push(payload.into_bytes());
            match gap {
                0 => {}
                1 => tokio::task::yield_now().await,
                _ => sleep(Duration::from_millis(1)).await,
            }
        }
        queue.close();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let batches = broker.batches();
        assert!(batches.iter().all(|batch| !batch.is_empty() && batch.len() <= 2));
        let flushed: Vec<Vec<u8>> = batches.into_iter().flatten().collect();
        assert_eq!(flushed, pushed);
        assert_eq!(statistics.messages_sent.get(), 300);
        assert_eq!(statistics.messages_dropped.get(), 0);
    }

    #[tokio::test]
    async fn test_time_trigger_flushes_idle_batch() {
        let broker = Arc::new(RecordingBroker::default());
        let (queue, _statistics, task) = start(config(10, 200, 1 << 20), Arc::clone(&broker));

        let pushed_at = Instant::now();
        queue.push(message("lonely")).await.unwrap();
        broker.wait_for_batches(1).await;

        let flushed_at = broker.sent.lock().unwrap()[0].0;
        let waited = flushed_at - pushed_at;
        assert!(waited >= Duration::from_millis(190), "flushed too early: {waited:?}");
        assert!(waited < Duration::from_millis(1000), "flushed too late: {waited:?}");
        assert_eq!(broker.batches(), vec![vec![b"lonely".to_vec()]]);

        queue.close();
        task.await.unwrap();
        assert_eq!(broker.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_bytes_trigger_fires_before_count() {
        let broker = Arc::new(RecordingBroker::default());
        let (queue, statistics, task) = start(config(10, 10_000, 100), Arc::clone(&broker));

        let payload = "x".repeat(60);
        queue.push(message(&payload)).await.unwrap();
        queue.push(message(&payload)).await.unwrap();
        broker.wait_for_batches(1).await;

        assert_eq!(broker.batches()[0].len(), 2);
        assert_eq!(statistics.bytes_sent.get(), 120);
        queue.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_partial_batch() {
        let broker = Arc::new(RecordingBroker::default());
        let (queue, statistics, task) = start(config(10, 10_000, 1 << 20), Arc::clone(&broker));

        queue.push(message("one")).await.unwrap();
        queue.push(message("two")).await.unwrap();
        queue.close();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(broker.batches(), vec![vec![b"one".to_vec(), b"two".to_vec()]]);
        assert_eq!(statistics.messages_sent.get(), 2);
    }

    #[tokio::test]
    async fn test_send_failure_drops_batch() {
        let broker = Arc::new(RecordingBroker::failing(1));
        let (queue, statistics, task) = start(config(2, 10_000, 1 << 20), Arc::clone(&broker));

        queue.push(message("lost 1")).await.unwrap();
        queue.push(message("lost 2")).await.unwrap();
        queue.push(message("kept")).await.unwrap();
        queue.close();
        task.await.unwrap();

        assert_eq!(broker.batches(), vec![vec![b"kept".to_vec()]]);
        assert_eq!(statistics.send_failures.get(), 1);
        assert_eq!(statistics.messages_dropped.get(), 2);
        assert_eq!(statistics.messages_sent.get(), 1);
        assert_eq!(statistics.batches_flushed.get(), 2);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let broker = Arc::new(RecordingBroker::failing(2));
        let mut config = config(1, 10_000, 1 << 20);
        config.retry = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        let (queue, statistics, task) = start(config, Arc::clone(&broker));

        queue.push(message("eventually")).await.unwrap();
        queue.close();
        task.await.unwrap();

        assert_eq!(broker.batches(), vec![vec![b"eventually".to_vec()]]);
        assert_eq!(statistics.retries.get(), 2);
        assert_eq!(statistics.send_failures.get(), 0);
        assert_eq!(statistics.messages_dropped.get(), 0);
    }

    #[tokio::test]
    async fn test_idle_producer_sends_nothing() {
        let broker = Arc::new(RecordingBroker::default());
        let (queue, statistics, task) = start(config(10, 50, 1 << 20), Arc::clone(&broker));
        sleep(Duration::from_millis(120)).await;
        queue.close();
        task.await.unwrap();
        assert!(broker.batches().is_empty());
        assert_eq!(statistics.statistics().unwrap().get("batches_flushed"), Some(0));
    }
}
