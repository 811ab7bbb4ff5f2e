// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process configuration, read from `GOLLECTOR_*` environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::broker::RetryPolicy;
use crate::constants::*;
use crate::errors::ConfigError;
use crate::message::WireFormat;
use crate::parser::ParserMode;
use crate::producer::ProducerConfig;
use crate::tcp::TcpServerConfig;
use crate::udp::UdpServerConfig;

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub admin_addr: String,
    pub tcp_addr: String,
    pub udp_addr: String,
    pub brokers: Vec<String>,
    pub topic: String,
    pub batch_size: usize,
    pub max_buffer_time: Duration,
    pub max_buffer_bytes: usize,
    pub parse_enabled: bool,
    pub queue_capacity: usize,
    pub max_message_size: usize,
    pub max_datagram_size: usize,
    pub send_retries: u32,
    pub retry_backoff: Duration,
    pub wire_format: WireFormat,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_addr: DEFAULT_ADMIN_ADDR.to_string(),
            tcp_addr: DEFAULT_TCP_ADDR.to_string(),
            udp_addr: DEFAULT_UDP_ADDR.to_string(),
            brokers: split_brokers(DEFAULT_BROKERS),
            topic: DEFAULT_TOPIC.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_buffer_time: Duration::from_millis(DEFAULT_MAX_BUFFER_TIME_MS),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            parse_enabled: DEFAULT_PARSE_ENABLED,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            send_retries: DEFAULT_SEND_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            wire_format: WireFormat::default(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let config = Config {
            admin_addr: get("GOLLECTOR_ADMIN_ADDR").unwrap_or(defaults.admin_addr),
            tcp_addr: get("GOLLECTOR_TCP_ADDR").unwrap_or(defaults.tcp_addr),
            udp_addr: get("GOLLECTOR_UDP_ADDR").unwrap_or(defaults.udp_addr),
            brokers: get("GOLLECTOR_BROKERS")
                .map(|v| split_brokers(&v))
                .unwrap_or(defaults.brokers),
            topic: get("GOLLECTOR_TOPIC").unwrap_or(defaults.topic),
            batch_size: parse_or(&get, "GOLLECTOR_BATCH_SIZE", defaults.batch_size)?,
            max_buffer_time: Duration::from_millis(parse_or(
                &get,
                "GOLLECTOR_MAX_BUFFER_TIME_MS",
                DEFAULT_MAX_BUFFER_TIME_MS,
            )?),
            max_buffer_bytes: parse_or(
                &get,
                "GOLLECTOR_MAX_BUFFER_BYTES",
                defaults.max_buffer_bytes,
            )?,
            parse_enabled: match get("GOLLECTOR_PARSE_ENABLED") {
                Some(v) => parse_bool("GOLLECTOR_PARSE_ENABLED", &v)?,
                None => defaults.parse_enabled,
            },
            queue_capacity: parse_or(&get, "GOLLECTOR_QUEUE_CAPACITY", defaults.queue_capacity)?,
            max_message_size: parse_or(
                &get,
                "GOLLECTOR_MAX_MESSAGE_SIZE",
                defaults.max_message_size,
            )?,
            max_datagram_size: parse_or(
                &get,
                "GOLLECTOR_MAX_DATAGRAM_SIZE",
                defaults.max_datagram_size,
            )?,
            send_retries: parse_or(&get, "GOLLECTOR_SEND_RETRIES", defaults.send_retries)?,
            retry_backoff: Duration::from_millis(parse_or(
                &get,
                "GOLLECTOR_RETRY_BACKOFF_MS",
                DEFAULT_RETRY_BACKOFF_MS,
            )?),
            wire_format: parse_or(&get, "GOLLECTOR_WIRE_FORMAT", defaults.wire_format)?,
            log_level: get("GOLLECTOR_LOG_LEVEL")
                .map(|v| v.to_lowercase())
                .unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what: &str| Err(ConfigError::Invalid(what.to_string()));
        if self.brokers.is_empty() {
            return invalid("at least one broker is required");
        }
        if self.topic.is_empty() {
            return invalid("topic must not be empty");
        }
        if self.batch_size == 0 {
            return invalid("batch size must be greater than zero");
        }
        if self.max_buffer_time.is_zero() {
            return invalid("max buffer time must be greater than zero");
        }
        if self.max_buffer_bytes == 0 {
            return invalid("max buffer bytes must be greater than zero");
        }
        if self.max_message_size == 0 || self.max_datagram_size == 0 {
            return invalid("message size limits must be greater than zero");
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "GOLLECTOR_LOG_LEVEL",
                value: self.log_level.clone(),
                reason: format!("expected one of {}", LOG_LEVELS.join(", ")),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn parser_mode(&self) -> ParserMode {
        ParserMode::from(self.parse_enabled)
    }

    #[must_use]
    pub fn tcp_config(&self) -> TcpServerConfig {
        TcpServerConfig {
            address: self.tcp_addr.clone(),
            max_message_size: self.max_message_size,
        }
    }

    #[must_use]
    pub fn udp_config(&self) -> UdpServerConfig {
        UdpServerConfig {
            address: self.udp_addr.clone(),
            max_datagram_size: self.max_datagram_size,
        }
    }

    #[must_use]
    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            topic: self.topic.clone(),
            batch_size: self.batch_size,
            max_buffer_time: self.max_buffer_time,
            max_buffer_bytes: self.max_buffer_bytes,
            retry: RetryPolicy {
                max_retries: self.send_retries,
                initial_backoff: self.retry_backoff,
                ..RetryPolicy::default()
            },
            wire_format: self.wire_format,
        }
    }
}

fn split_brokers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
