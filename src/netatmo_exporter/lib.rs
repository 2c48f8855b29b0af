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

//! Prometheus metrics exporter for Netatmo weather stations
//!
//! ## Features
//!
//! `netatmo_exporter` fetches the latest readings of every weather station on a
//! [Netatmo] account using the [Netatmo Connect] weather API and emits them as
//! Prometheus metrics. Readings are fetched on a fixed interval, independent of
//! how often Prometheus scrapes the exporter, and the last successful fetch keeps
//! being served while the API is unavailable.
//!
//! The following metrics are emitted when available (not every module reports
//! every value).
//!
//! * `netatmo_station_reachable{home, station, station_id, type, city, country, timezone}` - If the station is reachable.
//! * `netatmo_station_altitude`, `netatmo_station_longitude`, `netatmo_station_latitude` - Location of the station.
//! * `netatmo_station_wifi_status`, `netatmo_station_co2_calibrating` - Base station status.
//! * `netatmo_temperature{home, station, module, module_id, type}` - Temperature, in degrees celsius.
//! * `netatmo_temperature_min`, `netatmo_temperature_max`, `netatmo_temperature_trend` - Daily range and trend.
//! * `netatmo_humidity`, `netatmo_co2`, `netatmo_noise` - Relative humidity, CO2 in ppm, noise in dB.
//! * `netatmo_pressure`, `netatmo_absolute_pressure`, `netatmo_pressure_trend` - Pressure, in mbar.
//! * `netatmo_rain`, `netatmo_rain_1h`, `netatmo_rain_24h` - Rain, in mm.
//! * `netatmo_wind_*`, `netatmo_gust_*` - Wind and gust angle and strength.
//! * `netatmo_rf_status`, `netatmo_battery_vp`, `netatmo_battery_percent` - Module radio and battery status.
//!
//! The exporter also reports on itself under `netatmo_exporter_*`, most usefully
//! `netatmo_exporter_last_success_timestamp_seconds` for alerting on stale data and
//! `netatmo_exporter_auth_healthy` for a refresh token that needs replacing.
//!
//! [Netatmo]: https://www.netatmo.com/
//! [Netatmo Connect]: https://dev.netatmo.com/apidocumentation/weather
//!
//! ## Build
//!
//! `netatmo_exporter` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Credentials
//!
//! Create an app in the Netatmo developer console and generate a refresh token with
//! the `read_station` scope. The client ID, client secret, and refresh token are
//! passed via flags or environment variables.
//!
//! ```text
//! NETATMO_CLIENT_ID=... NETATMO_CLIENT_SECRET=... NETATMO_REFRESH_TOKEN=... ./netatmo_exporter
//! ```
//!
//! Netatmo issues a new refresh token every time the access token is refreshed and
//! the old one stops working. The current tokens are written to the token file
//! (`data/token.json` by default) after every refresh and read back at startup, so
//! the refresh token from the developer console is only needed the first time.
//!
//! If the refresh token is ever rejected, `/-/healthy` starts returning a 503 and
//! polling stops. Generate a new refresh token, write it into the `refresh_token`
//! field of the token file, and send the exporter a `SIGHUP` to pick it up.
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `9126` at `/metrics`. Once `netatmo_exporter`
//! is running, configure scrapes of it by your Prometheus server.
//!
//! ```yaml
//! scrape_configs:
//! - job_name: netatmo_exporter
//!   static_configs:
//!   - targets: ['example:9126']
//! ```
//!

pub mod cache;
pub mod client;
pub mod http;
pub mod metrics;
pub mod poller;
pub mod store;
pub mod token;
