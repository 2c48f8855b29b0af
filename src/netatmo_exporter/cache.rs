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

use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};

/// A single labeled value, e.g. the temperature reported by one outdoor module.
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    /// Metric name without the `netatmo_` prefix
    pub name: String,
    pub help: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// Every reading from one successful fetch. Never modified after it's built.
#[derive(Clone, Debug, PartialEq)]
pub struct StationSnapshot {
    pub fetched_at: DateTime<Utc>,
    pub readings: Vec<Reading>,
}

impl StationSnapshot {
    pub fn new(fetched_at: DateTime<Utc>, readings: Vec<Reading>) -> Self {
        StationSnapshot { fetched_at, readings }
    }
}

/// Holder for the most recent snapshot.
///
/// Publishing swaps an `Arc` under a write lock that is held only for the swap
/// itself, and readers clone the `Arc` under a read lock. A reader therefore
/// never waits on a fetch or token refresh and never sees a partial snapshot.
#[derive(Debug, Default)]
pub struct MetricCache {
    current: RwLock<Option<Arc<StationSnapshot>>>,
}

impl MetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the visible snapshot.
    pub fn publish(&self, snapshot: StationSnapshot) {
        let snapshot = Arc::new(snapshot);
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = Some(snapshot);
    }

    /// Latest published snapshot or `None` if nothing has been fetched yet.
    pub fn current(&self) -> Option<Arc<StationSnapshot>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
