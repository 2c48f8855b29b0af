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

//! OAuth2 refresh token rotation for the Netatmo account.
//!
//! Netatmo issues a new refresh token on every exchange and invalidates the one
//! that was used. Two exchanges racing with the same refresh token will lock the
//! account out, so every refresh happens while holding the state lock and any
//! caller that arrives during a refresh waits for it and reuses the result.

use crate::store::{TokenRecord, TokenStore};
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The auth endpoint refused the refresh token. There is no automated way to
    /// recover from this, an operator must supply a new refresh token.
    #[error("refresh token rejected: {0}")]
    Rejected(String),

    #[error("credential chain failed, a new refresh token is required")]
    Failed,

    #[error("token exchange failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {0} from token endpoint: {1}")]
    Unexpected(StatusCode, String),

    #[error("malformed token response: {0}")]
    Malformed(String),
}

impl AuthError {
    /// True when this error means the credential chain is broken for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::Failed)
    }
}

/// Successful response from the token endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    /// Lifetime assumed when the endpoint doesn't say, the usual Netatmo lifetime.
    pub const DEFAULT_LIFETIME_SECS: i64 = 10800;
    /// Longest lifetime that is believed. Anything beyond is treated as this.
    pub const MAX_LIFETIME_SECS: i64 = 86400 * 365;

    /// Absolute expiry of the access token issued at `now`. Out of range lifetimes
    /// are clamped rather than trusted.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self
            .expires_in
            .unwrap_or(Self::DEFAULT_LIFETIME_SECS)
            .clamp(0, Self::MAX_LIFETIME_SECS);

        now.checked_add_signed(Duration::seconds(secs)).unwrap_or(now)
    }
}

#[derive(Debug, Deserialize)]
struct GrantError {
    error: Option<String>,
}

/// Client for the OAuth2 token endpoint.
#[derive(Clone)]
pub struct AuthClient {
    client: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
}

impl fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthClient")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl AuthClient {
    const INVALID_GRANT: &'static str = "invalid_grant";

    pub fn new<S1, S2>(client: Client, token_url: Url, client_id: S1, client_secret: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        AuthClient {
            client,
            token_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Exchange a refresh token for a new access and refresh token.
    pub async fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        tracing::debug!(message = "making token exchange request", url = %self.token_url);

        let res = self
            .client
            .post(self.token_url.clone())
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = res.status();
        if status.is_success() {
            let body = res.text().await?;
            return serde_json::from_str::<TokenGrant>(&body).map_err(|e| AuthError::Malformed(e.to_string()));
        }

        let body = res.text().await.unwrap_or_default();
        let grant_error = serde_json::from_str::<GrantError>(&body).ok().and_then(|e| e.error);
        match (status, grant_error.as_deref()) {
            (StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED, Some(Self::INVALID_GRANT)) => {
                Err(AuthError::Rejected(body))
            }
            _ => Err(AuthError::Unexpected(status, body)),
        }
    }
}

#[derive(Debug)]
enum TokenState {
    /// A record we can exchange. The access token may or may not still be valid.
    Active(TokenRecord),
    /// The refresh token was rejected, nothing is attempted until a different one is loaded.
    Failed { rejected: String },
}

/// Owner of the authoritative in-memory token record and the only writer of the
/// token file.
#[derive(Debug)]
pub struct TokenManager {
    auth: AuthClient,
    store: TokenStore,
    margin: Duration,
    state: Mutex<TokenState>,
    failed: AtomicBool,
    refreshes: AtomicU64,
    persist_failures: AtomicU64,
}

impl TokenManager {
    /// Create a manager seeded from the token file, falling back to the bootstrap
    /// refresh token if the file is missing or unusable. Returns `None` if there is
    /// neither.
    pub async fn load(auth: AuthClient, store: TokenStore, bootstrap: Option<String>, margin: Duration) -> Option<Self> {
        let record = match store.load().await {
            Some(r) => r,
            None => {
                let token = bootstrap.filter(|t| !t.is_empty())?;
                tracing::info!(message = "seeding credentials from bootstrap refresh token");
                TokenRecord::bootstrap(token)
            }
        };

        Some(Self::new(auth, store, record, margin))
    }

    pub fn new(auth: AuthClient, store: TokenStore, record: TokenRecord, margin: Duration) -> Self {
        TokenManager {
            auth,
            store,
            margin,
            state: Mutex::new(TokenState::Active(record)),
            failed: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
        }
    }

    /// Get an access token that is valid for at least the safety margin, refreshing
    /// it first if needed. Callers that arrive while a refresh is running wait for it
    /// and get the same token.
    pub async fn current_access_token(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;
        let record = match &*state {
            TokenState::Failed { .. } => return Err(AuthError::Failed),
            TokenState::Active(r) => r,
        };

        let now = Utc::now();
        if !self.is_expiring(record, now) {
            return Ok(record.access_token.clone());
        }

        tracing::debug!(message = "access token expiring, refreshing", expires_at = %record.expires_at);
        let still_valid = (!record.access_token.is_empty() && record.expires_at > now).then(|| record.access_token.clone());

        match (self.refresh(&mut state).await, still_valid) {
            (Ok(token), _) => Ok(token),
            // The exchange failed for a reason that might go away. The old access token
            // hasn't hit its hard expiry yet so keep using it until the next attempt.
            (Err(e), Some(token)) if !e.is_fatal() => {
                tracing::warn!(message = "proactive token refresh failed, using existing token", error = %e);
                Ok(token)
            }
            (Err(e), _) => Err(e),
        }
    }

    /// Refresh the access token after the remote API rejected `rejected`, unless some
    /// other caller already replaced it, in which case the replacement is returned.
    pub async fn force_refresh(&self, rejected: &str) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;
        match &*state {
            TokenState::Failed { .. } => return Err(AuthError::Failed),
            TokenState::Active(r) if r.access_token != rejected && !self.is_expiring(r, Utc::now()) => {
                return Ok(r.access_token.clone());
            }
            TokenState::Active(_) => {}
        }

        tracing::info!(message = "access token rejected by remote API, forcing refresh");
        self.refresh(&mut state).await
    }

    /// Re-read the token file and adopt it if it holds a refresh token different from
    /// the one in memory. This is how an operator recovers a failed credential chain.
    /// Returns true if a new record was adopted.
    pub async fn reload(&self) -> bool {
        let record = match self.store.load().await {
            Some(r) => r,
            None => return false,
        };

        let mut state = self.state.lock().await;
        let changed = match &*state {
            TokenState::Failed { rejected } => *rejected != record.refresh_token,
            TokenState::Active(current) => current.refresh_token != record.refresh_token,
        };

        if changed {
            tracing::info!(message = "adopted refresh token from token file", path = %self.store.path().display());
            *state = TokenState::Active(record);
            self.failed.store(false, Ordering::Release);
        }

        changed
    }

    /// True once the refresh token has been rejected and not yet replaced.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    fn is_expiring(&self, record: &TokenRecord, now: DateTime<Utc>) -> bool {
        record.access_token.is_empty()
            || record
                .expires_at
                .checked_sub_signed(self.margin)
                .map_or(true, |refresh_at| refresh_at <= now)
    }

    /// Perform a single exchange. Must be called with the state lock held, which is
    /// what keeps refreshes from overlapping.
    async fn refresh(&self, state: &mut TokenState) -> Result<String, AuthError> {
        let previous = match state {
            TokenState::Failed { .. } => return Err(AuthError::Failed),
            TokenState::Active(r) => r.refresh_token.clone(),
        };

        let grant = match self.auth.exchange(&previous).await {
            Ok(g) => g,
            Err(e @ AuthError::Rejected(_)) => {
                tracing::error!(
                    message = "refresh token rejected, a new refresh token must be supplied",
                    error = %e,
                    path = %self.store.path().display(),
                );
                *state = TokenState::Failed { rejected: previous };
                self.failed.store(true, Ordering::Release);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(message = "token exchange failed", error = %e);
                return Err(e);
            }
        };

        if grant.expires_in.map_or(true, |s| !(0..=TokenGrant::MAX_LIFETIME_SECS).contains(&s)) {
            tracing::warn!(message = "token lifetime missing or out of range, clamping", expires_in = ?grant.expires_in);
        }

        let expires_at = grant.expires_at(Utc::now());
        let refresh_token = match grant.refresh_token {
            Some(t) if !t.is_empty() => t,
            _ => previous,
        };

        let record = TokenRecord {
            access_token: grant.access_token,
            refresh_token,
            expires_at,
        };

        // A failed write is not a reason to throw away the new token. The old refresh
        // token on disk is already dead either way, and the next refresh saves again.
        if let Err(e) = self.store.save(&record).await {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(message = "unable to persist refreshed token", error = %e);
        }

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        tracing::info!(message = "refreshed access token", expires_at = %record.expires_at);

        let access_token = record.access_token.clone();
        *state = TokenState::Active(record);
        Ok(access_token)
    }
}
