// netatmo_exporter - Prometheus metrics exporter for Netatmo weather stations
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::cache::StationSnapshot;
use crate::token::TokenManager;
use chrono::{DateTime, Utc};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::{ConstCounter, Counter};
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::{ConstGauge, Gauge};
use prometheus_client::registry::Registry;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;

pub const NAMESPACE: &str = "netatmo";
const EXPORTER_SUBSYSTEM: &str = "exporter";

type ReadingFamily = Family<Vec<(String, String)>, Gauge<f64, AtomicU64>>;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FailureLabels {
    reason: String,
}

/// Metrics about the exporter itself, updated by the poller.
///
/// These are emitted on every scrape even before the first successful fetch, so
/// the age of the data can be judged from `netatmo_exporter_last_success_timestamp_seconds`
/// rather than from a failing scrape.
#[derive(Clone, Debug, Default)]
pub struct ExporterMetrics {
    polls: Counter,
    failures: Family<FailureLabels, Counter>,
    last_success: Gauge,
}

impl ExporterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll(&self) {
        self.polls.inc();
    }

    pub fn success(&self, at: DateTime<Utc>) {
        self.last_success.set(at.timestamp());
    }

    pub fn failure(&self, reason: &str) {
        self.failures
            .get_or_create(&FailureLabels {
                reason: reason.to_owned(),
            })
            .inc();
    }

    /// Register the poller metrics and the current state of the token manager.
    pub fn register(&self, registry: &mut Registry, tokens: &TokenManager) {
        let reg = registry.sub_registry_with_prefix(EXPORTER_SUBSYSTEM);
        reg.register("polls", "Number of poll cycles started", self.polls.clone());
        reg.register(
            "fetch_failures",
            "Number of poll cycles that failed, by reason",
            self.failures.clone(),
        );
        reg.register(
            "last_success_timestamp_seconds",
            "Time of the last successful fetch of station data",
            self.last_success.clone(),
        );
        reg.register(
            "auth_healthy",
            "1 if the refresh token is usable, 0 if a new one must be supplied",
            ConstGauge::new(if tokens.is_failed() { 0 } else { 1 }),
        );
        reg.register(
            "token_refreshes",
            "Number of successful access token refreshes",
            ConstCounter::new(tokens.refreshes()),
        );
        reg.register(
            "token_persist_failures",
            "Number of refreshed tokens that could not be written to the token file",
            ConstCounter::new(tokens.persist_failures()),
        );
    }
}

/// Register one gauge family per metric name in the snapshot along with the time
/// the snapshot was fetched.
pub fn register_snapshot(registry: &mut Registry, snapshot: &StationSnapshot) {
    let mut families: BTreeMap<&str, (&str, ReadingFamily)> = BTreeMap::new();
    for reading in &snapshot.readings {
        let (_, family) = families
            .entry(reading.name.as_str())
            .or_insert_with(|| (reading.help.as_str(), ReadingFamily::default()));
        family.get_or_create(&reading.labels).set(reading.value);
    }

    for (name, (help, family)) in families {
        registry.register(name, help, family);
    }

    registry.sub_registry_with_prefix(EXPORTER_SUBSYSTEM).register(
        "snapshot_timestamp_seconds",
        "Time the currently exported station data was fetched",
        ConstGauge::new(snapshot.fetched_at.timestamp()),
    );
}
