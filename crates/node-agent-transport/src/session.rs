//! Session-token minting and refresh (§4.E).
//!
//! If `sessionTokenUrl` is configured, tokens are minted by POSTing the
//! bootstrap token and cached with their expiry; otherwise the bootstrap
//! token is used directly on every connect attempt.

use node_agent_core::{AgentConfig, AuthFailureKind, Error, Result, SessionToken, Telemetry};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct MintResponse {
    token: String,
    #[serde(rename = "expiresInSeconds")]
    expires_in_seconds: Option<i64>,
}

/// Outcome of a session-token refresh attempt, distinguishing the three
/// failure categories §4.E assigns distinct telemetry events to.
pub enum SessionOutcome {
    Token(SessionToken),
    Expired,
    Revoked,
    Unavailable,
}

pub struct SessionManager {
    client: reqwest::Client,
    cached: Mutex<Option<SessionToken>>,
    telemetry: Arc<Telemetry>,
}

impl SessionManager {
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cached: Mutex::new(None),
            telemetry,
        }
    }

    /// Resolve the token to use for the next connect attempt, minting or
    /// refreshing via `sessionTokenUrl` when configured and the cached token
    /// is within `refreshBufferSeconds` of expiry.
    pub async fn resolve(&self, config: &AgentConfig) -> Result<String> {
        let Some(ref url) = config.session_token_url else {
            return Ok(config.auth_token.clone());
        };

        let existing = self.cached.lock().clone();
        if let Some(cached) = existing {
            let fresh = match cached.expires_at_ms {
                None => true,
                Some(expires_at_ms) => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let buffer_ms = config.session_token_refresh_buffer_seconds as i64 * 1000;
                    expires_at_ms - now_ms > buffer_ms
                }
            };
            if fresh {
                return Ok(cached.token);
            }
        }

        match self.mint(url, config).await {
            SessionOutcome::Token(token) => {
                let value = token.token.clone();
                *self.cached.lock() = Some(token);
                Ok(value)
            }
            SessionOutcome::Expired => {
                self.telemetry.record_auth_expired();
                *self.cached.lock() = None;
                Err(Error::Auth(
                    AuthFailureKind::Expired,
                    "session token endpoint reported expired credentials".into(),
                ))
            }
            SessionOutcome::Revoked => {
                self.telemetry.record_auth_revoked();
                *self.cached.lock() = None;
                Err(Error::Auth(
                    AuthFailureKind::Revoked,
                    "session token endpoint reported revoked credentials".into(),
                ))
            }
            SessionOutcome::Unavailable => {
                self.telemetry.record_auth_unavailable();
                Err(Error::Transient("session token endpoint unavailable".into()))
            }
        }
    }

    async fn mint(&self, url: &str, config: &AgentConfig) -> SessionOutcome {
        let response = self
            .client
            .post(url)
            .timeout(config.session_token_request_timeout())
            .bearer_auth(&config.auth_token)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "session token request failed");
                return SessionOutcome::Unavailable;
            }
        };

        match response.status().as_u16() {
            401 => return SessionOutcome::Expired,
            403 => return SessionOutcome::Revoked,
            200..=299 => {}
            status => {
                warn!(status, "unexpected session token response status");
                return SessionOutcome::Unavailable;
            }
        }

        match response.json::<MintResponse>().await {
            Ok(body) => {
                let expires_at_ms = body
                    .expires_in_seconds
                    .map(|secs| chrono::Utc::now().timestamp_millis() + secs * 1000);
                debug!("session token minted");
                SessionOutcome::Token(SessionToken {
                    token: body.token,
                    expires_at_ms,
                })
            }
            Err(e) => {
                warn!(error = %e, "session token response body did not parse");
                SessionOutcome::Unavailable
            }
        }
    }

    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_agent_core::AgentConfig;

    fn sample_agent_config(session_token_url: Option<String>) -> AgentConfig {
        AgentConfig {
            cnc_url: "wss://cnc.example.com".to_string(),
            node_id: "n1".to_string(),
            location: "lab".to_string(),
            auth_token: "bootstrap-token".to_string(),
            public_url: None,
            session_token_url,
            session_token_request_timeout_ms: 5_000,
            session_token_refresh_buffer_seconds: 60,
            ws_allow_query_token_fallback: false,
            heartbeat_interval_ms: 30_000,
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 0,
            host_update_debounce_ms: 500,
            max_buffered_host_events: 2_000,
            host_event_flush_batch_size: 100,
            initial_sync_chunk_size: 100,
            host_stale_after_ms: 900_000,
        }
    }

    #[tokio::test]
    async fn without_session_url_bootstrap_token_is_used_directly() {
        let manager = SessionManager::new(Arc::new(Telemetry::new()));
        let config = sample_agent_config(None);
        let token = manager.resolve(&config).await.unwrap();
        assert_eq!(token, "bootstrap-token");
    }

    #[tokio::test]
    async fn cached_token_with_no_expiry_is_always_fresh() {
        let manager = SessionManager::new(Arc::new(Telemetry::new()));
        *manager.cached.lock() = Some(SessionToken {
            token: "cached".to_string(),
            expires_at_ms: None,
        });
        let config = sample_agent_config(Some("https://cnc.example.com/session".to_string()));
        let token = manager.resolve(&config).await.unwrap();
        assert_eq!(token, "cached");
    }
}
