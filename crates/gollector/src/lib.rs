// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog ingestion pipeline.
//!
//! Messages arrive over TCP ([`tcp`]) and UDP ([`udp`]), are handed through a bounded
//! [`queue::HandoffQueue`] to the RFC5424 [`parser`], and from there through a second queue to
//! the batching [`producer`], which publishes them to Kafka through a [`broker::Broker`].
//!
//! ```text
//!  tcp ─┐
//!       ├─> raw queue ─> parser ─> parsed queue ─> producer ─> broker
//!  udp ─┘
//! ```
//!
//! Every stage exposes its counters through [`statistics::StatisticsProvider`]; the
//! [`pipeline::Pipeline`] bundles them for the administrative HTTP server in [`admin`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod admin;
pub mod batch;
pub mod broker;
pub mod config;
pub mod constants;
pub mod errors;
pub mod message;
pub mod parser;
pub mod pipeline;
pub mod producer;
pub mod queue;
pub mod rfc5424;
pub mod statistics;
pub mod tcp;
pub mod udp;
