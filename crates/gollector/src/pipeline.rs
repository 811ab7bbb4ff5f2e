// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Handles on every running stage, shared with the admin server.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::errors::StatisticsError;
use crate::statistics::{StatisticsProvider, StatisticsSnapshot};

pub struct Pipeline {
    components: Vec<(&'static str, Arc<dyn StatisticsProvider>)>,
    started_at: DateTime<Utc>,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        tcp: Arc<dyn StatisticsProvider>,
        udp: Arc<dyn StatisticsProvider>,
        parser: Arc<dyn StatisticsProvider>,
        kafka: Arc<dyn StatisticsProvider>,
    ) -> Self {
        Self::with_components(vec![
            ("tcp", tcp),
            ("udp", udp),
            ("parser", parser),
            ("kafka", kafka),
        ])
    }

    #[must_use]
    pub fn with_components(components: Vec<(&'static str, Arc<dyn StatisticsProvider>)>) -> Self {
        Self {
            components,
            started_at: Utc::now(),
        }
    }

    /// Overrides the start time, normally with the moment the process started.
    #[must_use]
    pub fn with_start(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Snapshots of every component keyed by component name. Fails if any component does.
    pub fn statistics(&self) -> Result<Map<String, Value>, StatisticsError> {
        let mut merged = Map::new();
        for (name, component) in &self.components {
            let snapshot = component.statistics()?;
            merged.insert((*name).to_string(), snapshot_to_value(&snapshot));
        }
        Ok(merged)
    }

    /// Like [`Pipeline::statistics`], but reports each component's outcome separately.
    #[must_use]
    pub fn statistics_partial(
        &self,
    ) -> BTreeMap<&'static str, Result<StatisticsSnapshot, StatisticsError>> {
        self.components
            .iter()
            .map(|(name, component)| (*name, component.statistics()))
            .collect()
    }

    /// Start time and uptime, rendered for humans.
    #[must_use]
    pub fn diagnostics(&self) -> Map<String, Value> {
        let uptime = (Utc::now() - self.started_at).to_std().unwrap_or_default();
        let mut diagnostics = Map::new();
        diagnostics.insert("started".to_string(), Value::String(self.started_at.to_rfc3339()));
        diagnostics.insert("uptime".to_string(), Value::String(format!("{uptime:?}")));
        diagnostics
    }
}

fn snapshot_to_value(snapshot: &StatisticsSnapshot) -> Value {
    Value::Object(
        snapshot
            .iter()
            .map(|(name, value)| (name.to_string(), Value::from(value)))
            .collect(),
    )
}
