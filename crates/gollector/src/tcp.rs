// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog over TCP.
//!
//! Each accepted connection gets its own reader task. Streams are framed on LF (a preceding CR
//! is stripped), so messages from one connection reach the raw queue in the order they were
//! written. Oversized frames, and bytes left without a terminator when the peer closes, are
//! discarded and counted as framing errors.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::constants::{
    ACCEPT_ERROR_BACKOFF, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_TCP_ADDR, TCP_READ_BUFFER_SIZE,
};
use crate::errors::{BindError, StatisticsError};
use crate::message::{RawMessage, Transport};
use crate::queue::HandoffQueue;
use crate::statistics::{Counter, StatisticsProvider, StatisticsSnapshot};

/// Configuration for the TCP listener
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Address to bind to (e.g., "localhost:514")
    pub address: String,
    /// Longest accepted frame, excluding the terminator
    pub max_message_size: usize,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_TCP_ADDR.to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Default)]
pub struct TcpStatistics {
    pub connections: Counter,
    pub connections_active: Counter,
    pub messages: Counter,
    pub bytes: Counter,
    pub framing_errors: Counter,
}

impl StatisticsProvider for TcpStatistics {
    fn statistics(&self) -> Result<StatisticsSnapshot, StatisticsError> {
        Ok(StatisticsSnapshot::new()
            .with("connections", &self.connections)
            .with("connections_active", &self.connections_active)
            .with("messages", &self.messages)
            .with("bytes", &self.bytes)
            .with("framing_errors", &self.framing_errors))
    }
}

pub struct TcpServer {
    listener: TcpListener,
    config: TcpServerConfig,
    statistics: Arc<TcpStatistics>,
}

impl TcpServer {
    /// Binds the listening socket. Failing here is fatal for the process.
    pub async fn bind(config: TcpServerConfig) -> Result<TcpServer, BindError> {
        let listener = TcpListener::bind(&config.address)
            .await
            .map_err(|source| BindError {
                transport: "tcp",
                address: config.address.clone(),
                source,
            })?;
        Ok(TcpServer {
            listener,
            config,
            statistics: Arc::new(TcpStatistics::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn statistics(&self) -> Arc<TcpStatistics> {
        Arc::clone(&self.statistics)
    }

    /// Accepts connections until cancelled, then waits for open connections to wind down.
    pub async fn spin(self, raw_queue: HandoffQueue<RawMessage>, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("tcp: accepting syslog connections on {addr}");
        }
        let mut connections = JoinSet::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => match accept_error_backoff(&e) {
                        None => continue,
                        Some(backoff) => {
                            warn!("tcp: failed to accept connection: {e}");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = sleep(backoff) => continue,
                            }
                        }
                    },
                },
                finished = async {
                    match connections.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("tcp: connection reader panicked: {e:?}");
                        }
                    }
                    continue;
                },
            };

            self.statistics.connections.incr();
            debug!("tcp: accepted connection from {peer}");
            let reader = ConnectionReader {
                peer,
                raw_queue: raw_queue.clone(),
                statistics: Arc::clone(&self.statistics),
                max_message_size: self.config.max_message_size,
                cancel: cancel.clone(),
            };
            connections.spawn(reader.run(stream));
        }

        while connections.join_next().await.is_some() {}
        info!("tcp: listener stopped");
    }
}

struct ConnectionReader {
    peer: SocketAddr,
    raw_queue: HandoffQueue<RawMessage>,
    statistics: Arc<TcpStatistics>,
    max_message_size: usize,
    cancel: CancellationToken,
}

impl ConnectionReader {
    async fn run(self, stream: TcpStream) {
        self.statistics.connections_active.incr();
        let mut reader = BufReader::with_capacity(TCP_READ_BUFFER_SIZE, stream);
        let mut frame = Vec::with_capacity(1024);

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = read_frame(&mut reader, &mut frame, self.max_message_size) => result,
            };

            match result {
                Ok(Frame::Complete(consumed)) => {
                    self.statistics.bytes.add(consumed as u64);
                    if frame.is_empty() {
                        continue;
                    }
                    self.statistics.messages.incr();
                    let message = RawMessage::new(frame.as_slice(), Transport::Tcp, self.peer);
                    trace!(
                        "tcp: received message from {}: {}",
                        self.peer,
                        message.payload_lossy()
                    );
                    if self.raw_queue.push(message).await.is_err() {
                        debug!("tcp: raw queue closed, dropping connection from {}", self.peer);
                        break;
                    }
                }
                Ok(Frame::TooLong(consumed)) => {
                    self.statistics.bytes.add(consumed as u64);
                    self.statistics.framing_errors.incr();
                    debug!(
                        "tcp: discarded frame of {consumed} bytes from {} exceeding {} bytes",
                        self.peer, self.max_message_size
                    );
                }
                Ok(Frame::Partial(consumed)) => {
                    self.statistics.bytes.add(consumed as u64);
                    self.statistics.framing_errors.incr();
                    debug!(
                        "tcp: discarded unterminated frame of {consumed} bytes from {} at close",
                        self.peer
                    );
                    break;
                }
                Ok(Frame::Eof) => break,
                Err(e) => {
                    if !is_connection_reset(&e) {
                        debug!("tcp: read error on connection from {}: {e}", self.peer);
                    }
                    break;
                }
            }
        }

        self.statistics.connections_active.decr();
        debug!("tcp: connection from {} closed", self.peer);
    }
}

/// Outcome of reading one frame. Each variant carries the number of bytes consumed.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// `buf` holds the frame without its LF or CRLF terminator.
    Complete(usize),
    /// The frame exceeded the size limit and was skipped up to its terminator.
    TooLong(usize),
    /// The stream ended in the middle of a frame.
    Partial(usize),
    Eof,
}

/// Reads one LF-terminated frame into `buf`, holding at most `max_size` bytes in memory.
async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_size: usize,
) -> io::Result<Frame> {
    buf.clear();
    let mut consumed = 0;
    let mut too_long = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match consumed {
                0 => Frame::Eof,
                _ => Frame::Partial(consumed),
            });
        }

        let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (&available[..pos], true),
            None => (available, false),
        };

        if !too_long {
            if buf.len() + chunk.len() > max_size + 1 {
                // one spare byte so a CR before the LF does not count against the limit
                too_long = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }

        let step = chunk.len() + usize::from(done);
        consumed += step;
        reader.consume(step);

        if done {
            break;
        }
    }

    if too_long {
        return Ok(Frame::TooLong(consumed));
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if buf.len() > max_size {
        buf.clear();
        return Ok(Frame::TooLong(consumed));
    }
    Ok(Frame::Complete(consumed))
}

/// How long to pause after a failed accept. Resets by the peer are retried at once.
fn accept_error_backoff(e: &io::Error) -> Option<Duration> {
    if is_connection_reset(e) {
        None
    } else {
        Some(ACCEPT_ERROR_BACKOFF)
    }
}

fn is_connection_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
