// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const DEFAULT_ADMIN_ADDR: &str = "localhost:8080";
pub const DEFAULT_TCP_ADDR: &str = "localhost:514";
pub const DEFAULT_UDP_ADDR: &str = "localhost:514";
pub const DEFAULT_BROKERS: &str = "localhost:9092";
pub const DEFAULT_TOPIC: &str = "logs";

/// Maximum number of messages per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;
/// Maximum time a batch stays open, in milliseconds.
pub const DEFAULT_MAX_BUFFER_TIME_MS: u64 = 1000;
/// Maximum accumulated size of a batch, in bytes.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 512 * 1024;
pub const DEFAULT_PARSE_ENABLED: bool = true;
/// Handoff queue capacity. Zero means producer and consumer rendezvous.
pub const DEFAULT_QUEUE_CAPACITY: usize = 0;

/// Longest TCP frame accepted before it is discarded as a framing error.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
/// Largest UDP datagram accepted.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 8192;
/// Per-connection read buffer for TCP streams.
pub const TCP_READ_BUFFER_SIZE: usize = 16 * 1024;
/// Pause after a failed accept that is not a peer reset.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub const DEFAULT_SEND_RETRIES: u32 = 0;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;
pub const MAX_RETRY_BACKOFF_MS: u64 = 5_000;
/// Bound on connecting to the brokers and resolving the topic at start-up.
pub const BROKER_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_LOG_LEVEL: &str = "info";
