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

use crate::cache::MetricCache;
use crate::client::{FetchError, StationClient};
use crate::metrics::ExporterMetrics;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, Level};

/// Tracks consecutive failures and stretches the poll interval while the remote
/// API is struggling. A single success returns to the configured interval.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    // Rate limiting counts as this many failures
    const RATE_LIMIT_PENALTY: u32 = 2;
    const MAX_SHIFT: u32 = 16;

    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    pub fn success(&mut self) {
        self.failures = 0;
    }

    pub fn failure(&mut self, err: &FetchError) {
        let penalty = match err {
            FetchError::RateLimited(_) => Self::RATE_LIMIT_PENALTY,
            _ => 1,
        };

        self.failures = self.failures.saturating_add(penalty);
    }

    /// Delay before the next poll: the base interval doubled per consecutive
    /// failure, capped at the maximum.
    pub fn delay(&self) -> Duration {
        let factor = 1u32 << self.failures.min(Self::MAX_SHIFT);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// When the next poll should start given when the current one started. Polls never
/// overlap, and any deadlines that were missed while a slow poll was still running
/// are skipped instead of being run back to back.
pub fn next_deadline(started: Instant, delay: Duration, base: Duration, now: Instant) -> Instant {
    // Only reachable with absurd intervals, poll again one interval from now
    let fallback = now.checked_add(base).unwrap_or(now);
    let deadline = match started.checked_add(delay) {
        Some(d) => d,
        None => return fallback,
    };

    if deadline >= now || base.is_zero() {
        return deadline;
    }

    let behind = now - deadline;
    u32::try_from(behind.as_nanos() / base.as_nanos() + 1)
        .ok()
        .and_then(|missed| base.checked_mul(missed))
        .and_then(|skip| deadline.checked_add(skip))
        .unwrap_or(fallback)
}

/// Run `task` in the background and clear `running` once it ends for any reason,
/// including a panic. The returned handle completes after `running` is cleared.
pub fn supervise<F>(name: &'static str, task: F, running: Arc<AtomicBool>) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    running.store(true, Ordering::Release);
    let handle = tokio::spawn(task);

    tokio::spawn(async move {
        match handle.await {
            Ok(()) => tracing::error!(message = "background task exited", task = name),
            Err(e) => tracing::error!(message = "background task failed", task = name, error = %e),
        }

        running.store(false, Ordering::Release);
    })
}

/// Fetches station data on a fixed interval and publishes it to the cache. This is
/// the only writer of the cache.
#[derive(Debug)]
pub struct Poller {
    client: StationClient,
    cache: Arc<MetricCache>,
    metrics: ExporterMetrics,
    backoff: Backoff,
    interval: Duration,
}

impl Poller {
    pub fn new(
        client: StationClient,
        cache: Arc<MetricCache>,
        metrics: ExporterMetrics,
        interval: Duration,
        max_backoff: Duration,
    ) -> Self {
        Poller {
            client,
            cache,
            metrics,
            backoff: Backoff::new(interval, max_backoff),
            interval,
        }
    }

    /// Poll forever. Failures of individual polls are logged and never end the loop.
    pub async fn run(mut self) {
        tracing::info!(message = "station polling started", interval_secs = self.interval.as_secs());

        loop {
            let started = Instant::now();
            let _ = self.poll().instrument(tracing::span!(Level::DEBUG, "netatmo_poll")).await;

            let delay = self.backoff.delay();
            if delay > self.interval {
                tracing::info!(message = "backing off polling", delay_secs = delay.as_secs());
            }

            tokio::time::sleep_until(next_deadline(started, delay, self.interval, Instant::now())).await;
        }
    }

    /// Run a single fetch and publish cycle. On error the previously published
    /// snapshot is left in place.
    pub async fn poll(&mut self) -> Result<(), FetchError> {
        self.metrics.poll();

        match self.client.fetch().await {
            Ok(snapshot) => {
                tracing::info!(
                    message = "fetched new station data",
                    readings = snapshot.readings.len(),
                    fetched_at = %snapshot.fetched_at,
                );

                self.metrics.success(snapshot.fetched_at);
                self.cache.publish(snapshot);
                self.backoff.success();
                Ok(())
            }
            Err(e) => {
                self.metrics.failure(e.reason());
                match &e {
                    // Nothing was sent over the network so the remote API doesn't need a break
                    FetchError::Auth(a) if a.is_fatal() => {
                        tracing::error!(message = "skipping poll, credentials need operator attention", error = %e);
                    }
                    _ => {
                        self.backoff.failure(&e);
                        tracing::error!(message = "failed to fetch station data", error = %e);
                    }
                }

                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{next_deadline, supervise, Backoff};
    use crate::client::FetchError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn unavailable() -> FetchError {
        FetchError::Unavailable("connection refused".to_owned())
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(300), Duration::from_secs(1800));
        assert_eq!(Duration::from_secs(300), backoff.delay());

        backoff.failure(&unavailable());
        assert_eq!(Duration::from_secs(600), backoff.delay());

        backoff.failure(&unavailable());
        assert_eq!(Duration::from_secs(1200), backoff.delay());

        backoff.failure(&unavailable());
        assert_eq!(Duration::from_secs(1800), backoff.delay());

        for _ in 0..100 {
            backoff.failure(&unavailable());
        }
        assert_eq!(Duration::from_secs(1800), backoff.delay());
    }

    #[test]
    fn test_backoff_resets_on_success() {
        let mut backoff = Backoff::new(Duration::from_secs(300), Duration::from_secs(1800));
        backoff.failure(&unavailable());
        backoff.failure(&unavailable());
        backoff.success();
        assert_eq!(Duration::from_secs(300), backoff.delay());
    }

    #[test]
    fn test_backoff_rate_limited() {
        let mut backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(3600));
        backoff.failure(&FetchError::RateLimited("https://api.netatmo.com/".parse().unwrap()));
        assert_eq!(Duration::from_secs(240), backoff.delay());
    }

    #[test]
    fn test_backoff_max_below_base() {
        let backoff = Backoff::new(Duration::from_secs(300), Duration::from_secs(10));
        assert_eq!(Duration::from_secs(300), backoff.delay());
    }

    #[test]
    fn test_next_deadline_on_time() {
        let start = Instant::now();
        let base = Duration::from_secs(300);
        let deadline = next_deadline(start, base, base, start + Duration::from_secs(2));
        assert_eq!(start + base, deadline);
    }

    #[test]
    fn test_next_deadline_skips_missed() {
        let start = Instant::now();
        let base = Duration::from_secs(300);
        // The poll took longer than two intervals, the next one starts on the third tick
        let deadline = next_deadline(start, base, base, start + Duration::from_secs(700));
        assert_eq!(start + Duration::from_secs(900), deadline);
    }

    #[test]
    fn test_next_deadline_overflow() {
        let start = Instant::now();
        assert_eq!(start, next_deadline(start, Duration::MAX, Duration::MAX, start));

        // Far too many missed intervals to count, start over one interval from now
        let base = Duration::from_nanos(1);
        let now = start + Duration::from_secs(10);
        assert_eq!(now + base, next_deadline(start, base, base, now));
    }

    #[tokio::test]
    async fn test_supervise_clears_running_on_exit() {
        let running = Arc::new(AtomicBool::new(false));
        let handle = supervise("test", async {}, running.clone());
        handle.await.unwrap();
        assert!(!running.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_supervise_clears_running_on_panic() {
        let running = Arc::new(AtomicBool::new(false));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = supervise(
            "test",
            async move {
                let _ = rx.await;
                panic!("task crashed");
            },
            running.clone(),
        );

        assert!(running.load(Ordering::Acquire));
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(!running.load(Ordering::Acquire));
    }
}
