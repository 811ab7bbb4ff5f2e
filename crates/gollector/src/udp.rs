// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog over UDP. One datagram carries one message.
//!
//! A single task reads the socket, so datagrams reach the raw queue in arrival order. While the
//! queue is full the socket is not drained; anything the kernel drops in the meantime is not
//! visible in the counters.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::constants::{DEFAULT_MAX_DATAGRAM_SIZE, DEFAULT_UDP_ADDR};
use crate::errors::{BindError, StatisticsError};
use crate::message::{RawMessage, Transport};
use crate::queue::HandoffQueue;
use crate::statistics::{Counter, StatisticsProvider, StatisticsSnapshot};

/// Configuration for the UDP listener
#[derive(Debug, Clone)]
pub struct UdpServerConfig {
    /// Address to bind to (e.g., "localhost:514")
    pub address: String,
    /// Largest accepted datagram. Bigger ones are dropped.
    pub max_datagram_size: usize,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_UDP_ADDR.to_string(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

#[derive(Debug, Default)]
pub struct UdpStatistics {
    pub datagrams: Counter,
    pub bytes: Counter,
    pub oversized: Counter,
}

impl StatisticsProvider for UdpStatistics {
    fn statistics(&self) -> Result<StatisticsSnapshot, StatisticsError> {
        Ok(StatisticsSnapshot::new()
            .with("datagrams", &self.datagrams)
            .with("bytes", &self.bytes)
            .with("oversized", &self.oversized))
    }
}

pub struct UdpServer {
    socket: UdpSocket,
    config: UdpServerConfig,
    statistics: Arc<UdpStatistics>,
}

impl UdpServer {
    pub async fn bind(config: UdpServerConfig) -> Result<UdpServer, BindError> {
        let socket = UdpSocket::bind(&config.address)
            .await
            .map_err(|source| BindError {
                transport: "udp",
                address: config.address.clone(),
                source,
            })?;
        Ok(UdpServer {
            socket,
            config,
            statistics: Arc::new(UdpStatistics::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    #[must_use]
    pub fn statistics(&self) -> Arc<UdpStatistics> {
        Arc::clone(&self.statistics)
    }

    /// Reads datagrams until cancelled or the raw queue closes.
    pub async fn spin(self, raw_queue: HandoffQueue<RawMessage>, cancel: CancellationToken) {
        if let Ok(addr) = self.socket.local_addr() {
            info!("udp: receiving syslog datagrams on {addr}");
        }
        // one spare byte to tell a datagram at the limit from a truncated one
        let mut buf = vec![0u8; self.config.max_datagram_size + 1];

        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!("udp: failed to receive datagram: {e}");
                        continue;
                    }
                },
            };

            self.statistics.datagrams.incr();
            self.statistics.bytes.add(len as u64);
            if len > self.config.max_datagram_size {
                self.statistics.oversized.incr();
                debug!(
                    "udp: dropped datagram from {peer} larger than {} bytes",
                    self.config.max_datagram_size
                );
                continue;
            }

            let payload = trim_terminator(&buf[..len]);
            if payload.is_empty() {
                continue;
            }
            let message = RawMessage::new(payload, Transport::Udp, peer);
            trace!("udp: received message from {peer}: {}", message.payload_lossy());
            if raw_queue.push(message).await.is_err() {
                debug!("udp: raw queue closed, stopping");
                break;
            }
        }
        info!("udp: listener stopped");
    }
}

fn trim_terminator(datagram: &[u8]) -> &[u8] {
    let datagram = datagram.strip_suffix(b"\n").unwrap_or(datagram);
    datagram.strip_suffix(b"\r").unwrap_or(datagram)
}
