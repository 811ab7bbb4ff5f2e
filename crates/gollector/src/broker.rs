// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Publishing batches to Kafka.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::ClientBuilder;
use rskafka::record::Record;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::constants::{
    BROKER_CONNECT_TIMEOUT_SECS, DEFAULT_RETRY_BACKOFF_MS, DEFAULT_SEND_RETRIES,
    MAX_RETRY_BACKOFF_MS,
};
use crate::errors::BrokerError;

/// Destination for flushed batches.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Sends one record per element of `records`, preserving their order.
    async fn send(&self, topic: &str, records: &[Vec<u8>]) -> Result<(), BrokerError>;
}

/// How often a failed send is repeated before the batch is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_SEND_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_RETRY_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt`, starting at 1. Doubles each time up to `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Kafka producer for a single topic. Each send goes to the next partition in turn.
pub struct KafkaBroker {
    topic: String,
    partitions: Vec<PartitionClient>,
    next_partition: AtomicUsize,
}

impl KafkaBroker {
    pub async fn connect(brokers: &[String], topic: &str) -> Result<KafkaBroker, BrokerError> {
        let connect_timeout = Duration::from_secs(BROKER_CONNECT_TIMEOUT_SECS);
        let connect_error = |message: String| BrokerError::Connect {
            brokers: brokers.join(","),
            message,
        };

        let client = timeout(connect_timeout, ClientBuilder::new(brokers.to_vec()).build())
            .await
            .map_err(|_| connect_error(format!("timed out after {connect_timeout:?}")))?
            .map_err(|e| connect_error(e.to_string()))?;

        let topic_error = |message: String| BrokerError::Topic {
            topic: topic.to_string(),
            message,
        };
        let topics = timeout(connect_timeout, client.list_topics())
            .await
            .map_err(|_| topic_error(format!("timed out after {connect_timeout:?}")))?
            .map_err(|e| topic_error(e.to_string()))?;
        let partition_ids = topics
            .into_iter()
            .find(|t| t.name == topic)
            .map(|t| t.partitions)
            .filter(|partitions| !partitions.is_empty())
            .ok_or_else(|| topic_error("topic does not exist".to_string()))?;

        let mut partitions = Vec::with_capacity(partition_ids.len());
        for partition in partition_ids {
            let partition_client = client
                .partition_client(topic, partition, UnknownTopicHandling::Retry)
                .await
                .map_err(|e| topic_error(format!("partition {partition}: {e}")))?;
            partitions.push(partition_client);
        }

        info!(
            "kafka: connected to {} for topic {topic} with {} partitions",
            brokers.join(","),
            partitions.len()
        );
        Ok(KafkaBroker {
            topic: topic.to_string(),
            partitions,
            next_partition: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn send(&self, topic: &str, records: &[Vec<u8>]) -> Result<(), BrokerError> {
        let send_error = |message: String| BrokerError::Send {
            topic: topic.to_string(),
            records: records.len(),
            message,
        };
        if topic != self.topic {
            return Err(send_error(format!("producer is bound to topic {}", self.topic)));
        }
        let partition = self
            .next_partition
            .fetch_add(1, Ordering::Relaxed)
            .checked_rem(self.partitions.len())
            .and_then(|index| self.partitions.get(index))
            .ok_or_else(|| send_error("no partitions available".to_string()))?;

        let now = chrono::Utc::now();
        let batch = records
            .iter()
            .map(|value| Record {
                key: None,
                value: Some(value.clone()),
                headers: BTreeMap::new(),
                timestamp: now,
            })
            .collect();

        let offsets = partition
            .produce(batch, Compression::NoCompression)
            .await
            .map_err(|e| send_error(e.to_string()))?;
        debug!(
            "kafka: produced {} records to {topic}/{} at offsets {offsets:?}",
            records.len(),
            partition.partition()
        );
        Ok(())
    }
}
