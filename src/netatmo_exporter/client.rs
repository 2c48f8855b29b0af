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

use crate::cache::{Reading, StationSnapshot};
use crate::token::{AuthError, TokenManager};
use chrono::Utc;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

const UNKNOWN: &str = "Unknown";
const UNKNOWN_KEY_PREFIX: &str = "dashboard_";

const LABEL_HOME: &str = "home";
const LABEL_STATION: &str = "station";
const LABEL_STATION_ID: &str = "station_id";
const LABEL_MODULE: &str = "module";
const LABEL_MODULE_ID: &str = "module_id";
const LABEL_TYPE: &str = "type";
const LABEL_CITY: &str = "city";
const LABEL_COUNTRY: &str = "country";
const LABEL_TIMEZONE: &str = "timezone";

/// Dashboard keys and the metric name and help text they're exported as.
const DASHBOARD_METRICS: &[(&str, &str, &str)] = &[
    ("Temperature", "temperature", "The current Temperature"),
    ("min_temp", "temperature_min", "The current Min Temperature"),
    ("max_temp", "temperature_max", "The current Max Temperature"),
    ("temp_trend", "temperature_trend", "The current Temperature Trend"),
    ("Humidity", "humidity", "The current Humidity"),
    ("CO2", "co2", "The current CO2"),
    ("Pressure", "pressure", "The current Pressure"),
    ("pressure_trend", "pressure_trend", "The current Pressure Trend"),
    ("AbsolutePressure", "absolute_pressure", "The current Absolute Pressure"),
    ("Noise", "noise", "The current Noise"),
    ("Rain", "rain", "The current Rain"),
    ("sum_rain_1", "rain_1h", "Rain over the last 1h"),
    ("sum_rain_24", "rain_24h", "Rain over the last 24h"),
    ("WindAngle", "wind_angle", "The current Wind Angle"),
    ("WindStrength", "wind_strength", "The current Wind Strength"),
    ("max_wind_angle", "wind_max_angle", "The current Wind Max Angle"),
    ("max_wind_str", "wind_max_strength", "The current Wind Max Strength"),
    ("GustAngle", "gust_angle", "The current Gust Angle"),
    ("GustStrength", "gust_strength", "The current Gust Strength"),
];

/// Module types that describe the base station itself rather than an extra module.
const BASE_STATION_TYPES: &[&str] = &["NAMain", "NAWifiStation"];

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("unable to get access token: {0}")]
    Auth(#[from] AuthError),

    #[error("access token rejected by {0}")]
    Unauthorized(Url),

    #[error("rate limited by {0}")]
    RateLimited(Url),

    #[error("station data unavailable: {0}")]
    Unavailable(String),

    #[error("malformed station data: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Short, fixed name of the failure used as a metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Auth(e) if e.is_fatal() => "auth",
            Self::Auth(_) => "token",
            Self::Unauthorized(_) => "unauthorized",
            Self::RateLimited(_) => "rate_limited",
            Self::Unavailable(_) => "unavailable",
            Self::Malformed(_) => "malformed",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Unavailable(e.to_string())
    }
}

/// Client for the weather station data API.
///
/// Each fetch asks the `TokenManager` for an access token. If the API rejects a
/// token the manager still thought was good (clock skew, early revocation) the
/// token is refreshed and the request is retried once.
#[derive(Debug, Clone)]
pub struct StationClient {
    client: Client,
    data_url: Url,
    tokens: Arc<TokenManager>,
}

impl StationClient {
    const USER_AGENT: &'static str = "Netatmo Prometheus Exporter (netatmo_exporter)";
    const JSON_RESPONSE: &'static str = "application/json";

    // Netatmo error codes for a bad access token
    const ERR_INVALID_TOKEN: i64 = 2;
    const ERR_EXPIRED_TOKEN: i64 = 3;

    pub fn new(client: Client, data_url: Url, tokens: Arc<TokenManager>) -> Self {
        StationClient {
            client,
            data_url,
            tokens,
        }
    }

    /// Fetch the current readings of every station on the account.
    pub async fn fetch(&self) -> Result<StationSnapshot, FetchError> {
        let token = self.tokens.current_access_token().await?;
        let data = match self.stations_data(&token).await {
            Err(FetchError::Unauthorized(url)) => {
                tracing::warn!(message = "access token rejected, refreshing and retrying once", url = %url);
                let token = self.tokens.force_refresh(&token).await?;
                self.stations_data(&token).await?
            }
            res => res?,
        };

        Ok(StationSnapshot::new(Utc::now(), data.readings()))
    }

    async fn stations_data(&self, token: &str) -> Result<StationsData, FetchError> {
        tracing::debug!(message = "making station data request", url = %self.data_url);

        let res = self
            .client
            .post(self.data_url.clone())
            .bearer_auth(token)
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .send()
            .await?;

        let status = res.status();
        let body = res.text().await?;

        if status == StatusCode::OK {
            let parsed = serde_json::from_str::<StationsResponse>(&body).map_err(|e| FetchError::Malformed(e.to_string()))?;
            return parsed.body.ok_or_else(|| {
                let error = parsed.error.map(|e| e.to_string()).unwrap_or_else(|| "missing body".to_owned());
                FetchError::Malformed(error)
            });
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited(self.data_url.clone())),
            StatusCode::UNAUTHORIZED => Err(FetchError::Unauthorized(self.data_url.clone())),
            StatusCode::FORBIDDEN if self.is_token_error(&body) => Err(FetchError::Unauthorized(self.data_url.clone())),
            _ => Err(FetchError::Unavailable(format!(
                "unexpected status {} for {}",
                status, self.data_url
            ))),
        }
    }

    fn is_token_error(&self, body: &str) -> bool {
        serde_json::from_str::<StationsResponse>(body)
            .ok()
            .and_then(|r| r.error)
            .and_then(|e| e.get("code").and_then(Value::as_i64))
            .map(|code| code == Self::ERR_INVALID_TOKEN || code == Self::ERR_EXPIRED_TOKEN)
            .unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StationsResponse {
    #[serde(default)]
    pub body: Option<StationsData>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StationsData {
    pub devices: Vec<Device>,
}

impl StationsData {
    /// Flatten every station and module into individual readings. Values that are
    /// missing or not numeric are skipped rather than failing the whole fetch.
    pub fn readings(&self) -> Vec<Reading> {
        let mut out = Vec::new();
        for device in &self.devices {
            device.readings(&mut out);
        }
        out
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Device {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "type", default)]
    pub type_: Option<String>,
    #[serde(default)]
    pub station_name: Option<String>,
    #[serde(default)]
    pub module_name: Option<String>,
    #[serde(default)]
    pub home_name: Option<String>,
    #[serde(default)]
    pub reachable: Option<bool>,
    #[serde(default)]
    pub wifi_status: Option<f64>,
    #[serde(default)]
    pub co2_calibrating: Option<bool>,
    #[serde(default)]
    pub place: Place,
    #[serde(default)]
    pub dashboard_data: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub modules: Vec<Module>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Place {
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub location: Vec<f64>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Module {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "type", default)]
    pub type_: Option<String>,
    #[serde(default)]
    pub module_name: Option<String>,
    #[serde(default)]
    pub rf_status: Option<f64>,
    #[serde(default)]
    pub battery_vp: Option<f64>,
    #[serde(default)]
    pub battery_percent: Option<f64>,
    #[serde(default)]
    pub dashboard_data: Option<BTreeMap<String, Value>>,
}

impl Device {
    fn readings(&self, out: &mut Vec<Reading>) {
        let home = label_or_unknown(&self.home_name);
        let station = label_or_unknown(&self.station_name);
        let type_ = label_or_unknown(&self.type_);

        let station_labels = vec![
            label(LABEL_HOME, home),
            label(LABEL_STATION, station),
            label(LABEL_STATION_ID, &self.id),
            label(LABEL_TYPE, type_),
        ];

        let mut reachable_labels = station_labels.clone();
        reachable_labels.push(label(LABEL_CITY, label_or_unknown(&self.place.city)));
        reachable_labels.push(label(LABEL_COUNTRY, label_or_unknown(&self.place.country)));
        reachable_labels.push(label(LABEL_TIMEZONE, label_or_unknown(&self.place.timezone)));

        let station_values = [
            ("station_reachable", "If the station is reachable", self.reachable.map(bool_value), &reachable_labels),
            ("station_altitude", "The Altitude of the Station", self.place.altitude, &station_labels),
            ("station_longitude", "The Longitude of the Station", self.place.location.first().copied(), &station_labels),
            ("station_latitude", "The Latitude of the Station", self.place.location.get(1).copied(), &station_labels),
            ("station_wifi_status", "The current Wifi Status", self.wifi_status, &station_labels),
            ("station_co2_calibrating", "The current CO2 Calibrating Status", self.co2_calibrating.map(bool_value), &station_labels),
        ];

        for (name, help, value, labels) in station_values {
            if let Some(v) = value {
                out.push(reading(name, help, labels.clone(), v));
            }
        }

        if let Some(dashboard) = &self.dashboard_data {
            let labels = sensor_labels(home, station, label_or_unknown(&self.module_name), &self.id, type_);
            dashboard_readings(dashboard, &labels, out);
        }

        for module in &self.modules {
            if module.type_.as_deref().map(|t| BASE_STATION_TYPES.contains(&t)).unwrap_or(false) {
                continue;
            }

            module.readings(home, station, out);
        }
    }
}

impl Module {
    fn readings(&self, home: &str, station: &str, out: &mut Vec<Reading>) {
        let labels = sensor_labels(
            home,
            station,
            label_or_unknown(&self.module_name),
            &self.id,
            label_or_unknown(&self.type_),
        );

        let module_values = [
            ("rf_status", "The current RF Status", self.rf_status),
            ("battery_vp", "The current Battery VP", self.battery_vp),
            ("battery_percent", "The current Battery Percent", self.battery_percent),
        ];

        for (name, help, value) in module_values {
            if let Some(v) = value {
                out.push(reading(name, help, labels.clone(), v));
            }
        }

        if let Some(dashboard) = &self.dashboard_data {
            dashboard_readings(dashboard, &labels, out);
        }
    }
}

fn dashboard_readings(dashboard: &BTreeMap<String, Value>, labels: &[(String, String)], out: &mut Vec<Reading>) {
    for (key, value) in dashboard {
        if key == "time_utc" || key.starts_with("date_") {
            continue;
        }

        let value = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => trend_value(s),
            Value::Bool(b) => Some(bool_value(*b)),
            _ => None,
        };

        let v = match value {
            Some(v) => v,
            None => {
                tracing::debug!(message = "skipping non-numeric dashboard value", key = %key);
                continue;
            }
        };

        match DASHBOARD_METRICS.iter().find(|(k, _, _)| *k == key.as_str()) {
            Some((_, name, help)) => out.push(reading(name, help, labels.to_vec(), v)),
            None => {
                let name = dashboard_metric_name(key);
                let help = format!("Dashboard value {}", key);
                out.push(reading(&name, &help, labels.to_vec(), v));
            }
        }
    }
}

fn trend_value(trend: &str) -> Option<f64> {
    match trend.to_ascii_lowercase().as_str() {
        "up" => Some(1.0),
        "down" => Some(-1.0),
        "stable" => Some(0.0),
        _ => None,
    }
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Name for a dashboard key without a curated metric. The prefix keeps it from
/// starting with a digit or colliding with a curated name.
fn dashboard_metric_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();

    format!("{}{}", UNKNOWN_KEY_PREFIX, sanitized)
}

fn sensor_labels(home: &str, station: &str, module: &str, module_id: &str, type_: &str) -> Vec<(String, String)> {
    vec![
        label(LABEL_HOME, home),
        label(LABEL_STATION, station),
        label(LABEL_MODULE, module),
        label(LABEL_MODULE_ID, module_id),
        label(LABEL_TYPE, type_),
    ]
}

fn label_or_unknown(v: &Option<String>) -> &str {
    v.as_deref().unwrap_or(UNKNOWN)
}

fn label(k: &str, v: &str) -> (String, String) {
    (k.to_owned(), v.to_owned())
}

fn reading(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Reading {
    Reading {
        name: name.to_owned(),
        help: help.to_owned(),
        labels,
        value,
    }
}
