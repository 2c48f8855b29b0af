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
use crate::metrics::{register_snapshot, ExporterMetrics, NAMESPACE};
use crate::token::TokenManager;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const TEXT_FORMAT: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Everything a scrape needs to read. None of it is locked for longer than it
/// takes to clone an `Arc` or load an atomic, so scrapes never wait on polling.
#[derive(Debug)]
pub struct RequestContext {
    cache: Arc<MetricCache>,
    tokens: Arc<TokenManager>,
    metrics: ExporterMetrics,
    polling: Arc<AtomicBool>,
}

impl RequestContext {
    /// `polling` is cleared by the poller's supervisor if the poll task ever ends.
    pub fn new(
        cache: Arc<MetricCache>,
        tokens: Arc<TokenManager>,
        metrics: ExporterMetrics,
        polling: Arc<AtomicBool>,
    ) -> Self {
        RequestContext {
            cache,
            tokens,
            metrics,
            polling,
        }
    }

    /// Encode the exporter metrics and, if anything has been fetched yet, the
    /// latest station readings in the text exposition format.
    pub fn render(&self) -> Result<String, fmt::Error> {
        let mut registry = Registry::with_prefix(NAMESPACE);
        self.metrics.register(&mut registry, &self.tokens);

        if let Some(snapshot) = self.cache.current() {
            register_snapshot(&mut registry, &snapshot);
        }

        let mut buf = String::new();
        encode(&mut buf, &registry)?;
        Ok(buf)
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        !self.tokens.is_failed() && self.is_polling()
    }
}

/// Build the router serving `/metrics` and `/-/healthy`.
pub fn router(context: Arc<RequestContext>) -> Router {
    Router::new()
        .route("/metrics", get(text_metrics))
        .route("/-/healthy", get(healthy))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

pub async fn text_metrics(State(context): State<Arc<RequestContext>>) -> Response {
    match context.render() {
        Ok(buf) => {
            tracing::debug!(message = "encoded prometheus metrics to text format", num_bytes = buf.len());
            (StatusCode::OK, [(CONTENT_TYPE, TEXT_FORMAT)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn healthy(State(context): State<Arc<RequestContext>>) -> Response {
    if context.is_healthy() {
        (StatusCode::OK, "OK\n").into_response()
    } else if !context.is_polling() {
        (StatusCode::SERVICE_UNAVAILABLE, "station polling stopped\n").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "refresh token rejected, a new token is required\n").into_response()
    }
}
