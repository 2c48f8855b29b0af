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

use clap::Parser;
use netatmo_exporter::cache::MetricCache;
use netatmo_exporter::client::StationClient;
use netatmo_exporter::http::RequestContext;
use netatmo_exporter::metrics::ExporterMetrics;
use netatmo_exporter::poller::{self, Poller};
use netatmo_exporter::store::TokenStore;
use netatmo_exporter::token::{AuthClient, TokenManager};
use reqwest::{Client, Url};
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9126);
const DEFAULT_REFRESH_SECS: u64 = 300;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 1800;
const DEFAULT_TIMEOUT_MILLIS: u64 = 10000;
const DEFAULT_TOKEN_MARGIN_SECS: i64 = 60;
const MAX_TOKEN_MARGIN_SECS: i64 = 86400;
const MAX_DURATION_SECS: u64 = 86400 * 7;
const DEFAULT_API_URL: &str = "https://api.netatmo.com/";
const DEFAULT_TOKEN_FILE: &str = "data/token.json";

/// Flags take precedence over environment variables, which take precedence over defaults.
#[derive(Debug, Parser)]
#[clap(name = "netatmo_exporter", version = clap::crate_version!())]
struct NetatmoExporterApplication {
    /// OAuth2 client ID of the Netatmo app
    #[clap(long, env = "NETATMO_CLIENT_ID")]
    client_id: String,

    /// OAuth2 client secret of the Netatmo app
    #[clap(long, env = "NETATMO_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,

    /// Refresh token to start with when there is no usable token file. Once the
    /// token file exists it takes precedence over this value.
    #[clap(long, env = "NETATMO_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    /// File to persist the current access and refresh tokens to
    #[clap(long, env = "NETATMO_TOKEN_FILE", default_value = DEFAULT_TOKEN_FILE)]
    token_file: PathBuf,

    /// Base URL for the Netatmo API
    #[clap(long, env = "NETATMO_API_URL", default_value_t = DEFAULT_API_URL.into())]
    api_url: String,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, env = "LOGLEVEL", default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Fetch station data from the Netatmo API at this interval, in seconds.
    #[clap(long, env = "INTERVAL", default_value_t = DEFAULT_REFRESH_SECS, value_parser = clap::value_parser!(u64).range(1..=MAX_DURATION_SECS))]
    refresh_secs: u64,

    /// Upper bound on the poll interval while backing off after failures, in seconds.
    #[clap(long, env = "MAX_BACKOFF", default_value_t = DEFAULT_MAX_BACKOFF_SECS, value_parser = clap::value_parser!(u64).range(1..=MAX_DURATION_SECS))]
    max_backoff_secs: u64,

    /// Timeout for requests to the Netatmo API, in milliseconds.
    #[clap(long, env = "TIMEOUT_MILLIS", default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Refresh the access token when it expires within this many seconds.
    #[clap(long, env = "TOKEN_MARGIN", default_value_t = DEFAULT_TOKEN_MARGIN_SECS, value_parser = clap::value_parser!(i64).range(0..=MAX_TOKEN_MARGIN_SECS))]
    token_margin_secs: i64,

    /// Address to bind to. By default, netatmo_exporter will bind to public address since
    /// the purpose is to expose metrics to an external system (Prometheus or another
    /// agent for ingestion)
    #[clap(long, env = "LISTEN_ADDR", default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = NetatmoExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    let (token_url, data_url) = api_urls(&opts.api_url).unwrap_or_else(|e| {
        tracing::error!(message = "invalid API URL", api_url = %opts.api_url, error = %e);
        process::exit(1)
    });

    let auth = AuthClient::new(http_client.clone(), token_url, &opts.client_id, &opts.client_secret);
    let store = TokenStore::new(&opts.token_file);
    let margin = chrono::Duration::seconds(opts.token_margin_secs);
    let tokens = TokenManager::load(auth, store, opts.refresh_token.clone(), margin)
        .await
        .map(Arc::new)
        .unwrap_or_else(|| {
            tracing::error!(
                message = "no usable token file and no refresh token supplied",
                token_file = %opts.token_file.display(),
            );
            process::exit(1)
        });

    // Make sure we have a working access token before starting to poll. This is also
    // where a bootstrap refresh token gets exchanged and persisted for the first time.
    match tokens.current_access_token().await {
        Err(e) if e.is_fatal() => {
            tracing::error!(message = "refresh token rejected at startup", error = %e);
        }
        Err(e) => {
            tracing::warn!(message = "failed to obtain initial access token", error = %e);
        }
        Ok(_) => {
            tracing::debug!(message = "verified access token");
        }
    }

    let cache = Arc::new(MetricCache::new());
    let metrics = ExporterMetrics::new();
    let client = StationClient::new(http_client, data_url, tokens.clone());
    let poller = Poller::new(
        client,
        cache.clone(),
        metrics.clone(),
        Duration::from_secs(opts.refresh_secs),
        Duration::from_secs(opts.max_backoff_secs),
    );

    let polling = Arc::new(AtomicBool::new(true));
    poller::supervise("netatmo_poller", poller.run(), polling.clone());

    let reload_tokens = tokens.clone();
    tokio::spawn(async move {
        let mut hangups = match unix::signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(message = "unable to listen for SIGHUP, token reload disabled", error = %e);
                return;
            }
        };

        while hangups.recv().await.is_some() {
            if !reload_tokens.reload().await {
                tracing::info!(message = "token file unchanged, nothing to reload");
            }
        }
    });

    let context = Arc::new(RequestContext::new(cache, tokens, metrics, polling));
    let app = netatmo_exporter::http::router(context);
    let server = axum::Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
        process::exit(1)
    });

    tracing::info!(message = "server started", address = %opts.bind, api_url = %opts.api_url);

    server
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    tracing::info!("server shutdown");
    Ok(())
}

/// Token endpoint and station data endpoint relative to the API base URL
fn api_urls(base: &str) -> Result<(Url, Url), Box<dyn Error + Send + Sync>> {
    let base = Url::parse(base)?;
    Ok((base.join("oauth2/token")?, base.join("api/getstationsdata")?))
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::NetatmoExporterApplication;
    use clap::Parser;

    fn parse(extra: &[&str]) -> Result<NetatmoExporterApplication, clap::Error> {
        let mut args = vec!["netatmo_exporter", "--client-id", "id", "--client-secret", "secret"];
        args.extend_from_slice(extra);
        NetatmoExporterApplication::try_parse_from(args)
    }

    #[test]
    fn test_explicit_values() {
        let opts = parse(&["--token-margin-secs", "120", "--refresh-secs", "600"]).unwrap();
        assert_eq!(120, opts.token_margin_secs);
        assert_eq!(600, opts.refresh_secs);
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        assert!(parse(&["--token-margin-secs", "9223372036854775807"]).is_err());
        assert!(parse(&["--token-margin-secs", "-1"]).is_err());
        assert!(parse(&["--refresh-secs", "0"]).is_err());
        assert!(parse(&["--max-backoff-secs", "18446744073709551615"]).is_err());
    }
}
