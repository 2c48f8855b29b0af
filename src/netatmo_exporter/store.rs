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

//! Durable storage for the OAuth2 token pair.
//!
//! The token file is pretty-printed JSON so that an operator can inspect it or
//! replace the refresh token by hand. Every save goes through a temporary file
//! in the same directory followed by a rename, so a reader never sees a
//! half-written record.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unable to encode token record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unable to write token file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// The access/refresh token pair for the account along with the absolute time
/// the access token stops being valid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "unix_seconds", default = "epoch")]
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    /// A record that only carries a refresh token, used to seed the manager from
    /// configuration. The access token is empty and already expired.
    pub fn bootstrap<S: Into<String>>(refresh_token: S) -> Self {
        TokenRecord {
            access_token: String::new(),
            refresh_token: refresh_token.into(),
            expires_at: epoch(),
        }
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH)
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// `expires_at` is written as integer seconds since the epoch. Older token files
/// used fractional seconds or `null`, both of which are still accepted.
mod unix_seconds {
    use super::*;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.timestamp())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs
            .and_then(|s| Utc.timestamp_opt(s.trunc() as i64, 0).single())
            .unwrap_or_else(epoch))
    }
}

/// File backed store for a single `TokenRecord`.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        TokenStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted record, returning `None` if the file is missing, unreadable,
    /// or doesn't contain a usable record. Callers are expected to fall back to a
    /// bootstrap refresh token in that case.
    pub async fn load(&self) -> Option<TokenRecord> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(message = "no existing token file found", path = %self.path.display());
                return None;
            }
            Err(e) => {
                tracing::warn!(message = "unable to read token file", path = %self.path.display(), error = %e);
                return None;
            }
        };

        match serde_json::from_str::<TokenRecord>(&contents) {
            Ok(record) if record.refresh_token.is_empty() => {
                tracing::warn!(message = "token file has an empty refresh token", path = %self.path.display());
                None
            }
            Ok(record) => {
                tracing::debug!(message = "loaded token file", path = %self.path.display(), expires_at = %record.expires_at);
                Some(record)
            }
            Err(e) => {
                tracing::warn!(message = "unable to parse token file", path = %self.path.display(), error = %e);
                None
            }
        }
    }

    /// Persist the record by writing a sibling temporary file and renaming it over
    /// the token file. The file is only readable by the owner on unix systems.
    pub async fn save(&self, record: &TokenRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(record)?;
        let tmp = self.tmp_path();

        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(|e| self.io_err(e))?;
        }

        let res = self.write_tmp(&tmp, json.as_bytes()).await;
        if let Err(e) = res {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(self.io_err(e));
        }

        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.io_err(e))?;
        tracing::debug!(message = "persisted token file", path = %self.path.display());
        Ok(())
    }

    async fn write_tmp(&self, tmp: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = tokio::fs::File::create(tmp).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
        }

        file.write_all(contents).await?;
        file.sync_all().await
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "token.json".to_owned());
        self.path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()))
    }

    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
