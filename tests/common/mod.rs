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

//! Stand-in for the Netatmo token and station data endpoints.

#![allow(dead_code)]

use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Form, Router};
use chrono::{Duration, Utc};
use netatmo_exporter::store::{TokenRecord, TokenStore};
use netatmo_exporter::token::{AuthClient, TokenManager};
use reqwest::{Client, Url};
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const STATIONS_PAYLOAD: &str = r#"{
  "body": {
    "devices": [
      {
        "_id": "70:ee:50:00:00:01",
        "type": "NAMain",
        "station_name": "Home (Indoor)",
        "module_name": "Indoor",
        "home_name": "Home",
        "reachable": true,
        "place": {"altitude": 45, "city": "Boston", "country": "US", "timezone": "America/New_York", "location": [-71.05, 42.36]},
        "dashboard_data": {"time_utc": 1700000000, "Temperature": 21.5, "Humidity": 44, "temp_trend": "stable"},
        "modules": [
          {
            "_id": "02:00:00:00:00:01",
            "type": "NAModule1",
            "module_name": "Outdoor",
            "battery_percent": 81,
            "dashboard_data": {"time_utc": 1700000000, "Temperature": 4.5, "Humidity": 80}
          }
        ]
      }
    ]
  },
  "status": "ok"
}"#;

pub fn grant(access: &str, refresh: &str, expires_in: i64) -> (u16, String) {
    (
        200,
        format!(
            r#"{{"access_token": "{}", "refresh_token": "{}", "expires_in": {}}}"#,
            access, refresh, expires_in
        ),
    )
}

pub fn invalid_grant() -> (u16, String) {
    (400, r#"{"error": "invalid_grant"}"#.to_owned())
}

pub fn stations() -> (u16, String) {
    (200, STATIONS_PAYLOAD.to_owned())
}

pub fn invalid_access_token() -> (u16, String) {
    (403, r#"{"error": {"code": 2, "message": "Invalid access token"}}"#.to_owned())
}

#[derive(Debug, Default)]
pub struct MockState {
    pub exchanges: AtomicUsize,
    pub data_requests: AtomicUsize,
    pub exchange_delay: std::time::Duration,
    pub token_responses: Mutex<VecDeque<(u16, String)>>,
    pub data_responses: Mutex<VecDeque<(u16, String)>>,
    pub refresh_tokens_seen: Mutex<Vec<String>>,
    pub bearer_tokens_seen: Mutex<Vec<String>>,
}

impl MockState {
    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn data_requests(&self) -> usize {
        self.data_requests.load(Ordering::SeqCst)
    }

    pub fn push_token(&self, res: (u16, String)) {
        self.token_responses.lock().unwrap().push_back(res);
    }

    pub fn push_data(&self, res: (u16, String)) {
        self.data_responses.lock().unwrap().push_back(res);
    }

    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_tokens_seen.lock().unwrap().clone()
    }

    pub fn bearer_tokens_seen(&self) -> Vec<String> {
        self.bearer_tokens_seen.lock().unwrap().clone()
    }
}

pub struct MockApi {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockApi {
    pub fn start() -> Self {
        Self::start_with(MockState::default())
    }

    pub fn start_with(state: MockState) -> Self {
        let state = Arc::new(state);
        let app = Router::new()
            .route("/oauth2/token", post(token))
            .route("/api/getstationsdata", post(stations_data))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service());
        tokio::spawn(server);

        MockApi { addr, state }
    }

    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}/", self.addr)).unwrap()
    }

    pub fn token_url(&self) -> Url {
        self.base_url().join("oauth2/token").unwrap()
    }

    pub fn data_url(&self) -> Url {
        self.base_url().join("api/getstationsdata").unwrap()
    }

    pub fn auth_client(&self) -> AuthClient {
        AuthClient::new(http_client(), self.token_url(), "client-id", "client-secret")
    }

    /// Token manager persisting to `dir` and seeded with `record`
    pub fn token_manager(&self, dir: &Path, record: TokenRecord) -> TokenManager {
        TokenManager::new(
            self.auth_client(),
            TokenStore::new(dir.join("token.json")),
            record,
            Duration::seconds(60),
        )
    }
}

pub fn http_client() -> Client {
    Client::builder().timeout(std::time::Duration::from_secs(5)).build().unwrap()
}

/// A record whose access token is good for another `secs` seconds
pub fn record_expiring_in(access: &str, refresh: &str, secs: i64) -> TokenRecord {
    TokenRecord {
        access_token: access.to_owned(),
        refresh_token: refresh.to_owned(),
        expires_at: Utc::now() + Duration::seconds(secs),
    }
}

async fn token(State(state): State<Arc<MockState>>, Form(form): Form<HashMap<String, String>>) -> (StatusCode, String) {
    state.exchanges.fetch_add(1, Ordering::SeqCst);
    if let Some(t) = form.get("refresh_token") {
        state.refresh_tokens_seen.lock().unwrap().push(t.clone());
    }

    if form.get("grant_type").map(String::as_str) != Some("refresh_token")
        || form.get("client_id").map(String::as_str) != Some("client-id")
        || form.get("client_secret").map(String::as_str) != Some("client-secret")
    {
        return (StatusCode::BAD_REQUEST, r#"{"error": "invalid_client"}"#.to_owned());
    }

    if !state.exchange_delay.is_zero() {
        tokio::time::sleep(state.exchange_delay).await;
    }

    let next = state.token_responses.lock().unwrap().pop_front();
    respond(next)
}

async fn stations_data(State(state): State<Arc<MockState>>, headers: HeaderMap) -> (StatusCode, String) {
    state.data_requests.fetch_add(1, Ordering::SeqCst);
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_owned();
    state.bearer_tokens_seen.lock().unwrap().push(bearer);

    let next = state.data_responses.lock().unwrap().pop_front();
    respond(next)
}

fn respond(next: Option<(u16, String)>) -> (StatusCode, String) {
    match next {
        Some((status, body)) => (StatusCode::from_u16(status).unwrap(), body),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "no response queued".to_owned()),
    }
}
