//! Configuration (§4.I): environment-variable driven, validated once at
//! startup. `Config::validate` is the single gate a caller must pass before
//! starting the runtime; a failure here is fatal per §7 ("configuration
//! invalid at startup: abort process after logging").

use crate::error::{Error, Result};
use std::env;
use std::time::Duration;

/// Top-level run mode (§4.I `agent.mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Discovery + local store only, no C&C connection.
    Standalone,
    /// Standalone plus a persistent connection to a C&C service.
    Agent,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub env: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub scan_interval_ms: u64,
    pub scan_delay_ms: u64,
    pub ping_timeout_ms: u64,
    pub ping_concurrency: usize,
    pub use_ping_validation: bool,
}

#[derive(Debug, Clone)]
pub struct WakeVerificationConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

/// Agent-mode-only settings (§4.I `agent.*`); required when `mode == Agent`.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub cnc_url: String,
    pub node_id: String,
    pub location: String,
    pub auth_token: String,
    pub public_url: Option<String>,
    pub session_token_url: Option<String>,
    pub session_token_request_timeout_ms: u64,
    pub session_token_refresh_buffer_seconds: u64,
    pub ws_allow_query_token_fallback: bool,
    pub heartbeat_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub host_update_debounce_ms: u64,
    pub max_buffered_host_events: usize,
    pub host_event_flush_batch_size: usize,
    pub initial_sync_chunk_size: usize,
    pub host_stale_after_ms: i64,
}

impl AgentConfig {
    pub fn session_token_request_timeout(&self) -> Duration {
        Duration::from_millis(self.session_token_request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn host_update_debounce(&self) -> Duration {
        Duration::from_millis(self.host_update_debounce_ms)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub network: NetworkConfig,
    pub wake_verification: WakeVerificationConfig,
    pub mode: Mode,
    pub agent: Option<AgentConfig>,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Config {
    /// Load every recognised option from the process environment (§6),
    /// applying defaults for anything unset, then [`Config::validate`] it.
    pub fn from_env() -> Result<Self> {
        let mode = match env_string("NODE_MODE", "standalone").to_lowercase().as_str() {
            "agent" => Mode::Agent,
            _ => Mode::Standalone,
        };

        let agent = if mode == Mode::Agent {
            Some(AgentConfig {
                cnc_url: env_string("CNC_URL", ""),
                node_id: env_string("NODE_ID", ""),
                location: env_string("NODE_LOCATION", ""),
                auth_token: env_string("NODE_AUTH_TOKEN", ""),
                public_url: env_opt_string("NODE_PUBLIC_URL"),
                session_token_url: env_opt_string("NODE_SESSION_TOKEN_URL"),
                session_token_request_timeout_ms: env_parse(
                    "NODE_SESSION_TOKEN_REQUEST_TIMEOUT_MS",
                    10_000,
                ),
                session_token_refresh_buffer_seconds: env_parse(
                    "NODE_SESSION_TOKEN_REFRESH_BUFFER_SECONDS",
                    60,
                ),
                ws_allow_query_token_fallback: env_bool(
                    "WS_ALLOW_QUERY_TOKEN_FALLBACK",
                    false,
                ),
                heartbeat_interval_ms: env_parse("HEARTBEAT_INTERVAL", 30_000),
                reconnect_interval_ms: env_parse("RECONNECT_INTERVAL", 5_000),
                max_reconnect_attempts: env_parse("MAX_RECONNECT_ATTEMPTS", 0),
                host_update_debounce_ms: env_parse("NODE_HOST_UPDATE_DEBOUNCE_MS", 500),
                max_buffered_host_events: env_parse("NODE_MAX_BUFFERED_HOST_EVENTS", 2_000),
                host_event_flush_batch_size: env_parse(
                    "NODE_HOST_EVENT_FLUSH_BATCH_SIZE",
                    100,
                ),
                initial_sync_chunk_size: env_parse("NODE_INITIAL_SYNC_CHUNK_SIZE", 100),
                host_stale_after_ms: env_parse("NODE_HOST_STALE_AFTER_MS", 15 * 60 * 1000),
            })
        } else {
            None
        };

        let config = Config {
            server: ServerConfig {
                port: env_parse("PORT", 8080),
                host: env_string("HOST", "0.0.0.0"),
                env: env_string("NODE_ENV", "development"),
            },
            database: DatabaseConfig {
                path: env_string("DATABASE_PATH", "node-agent.db"),
            },
            network: NetworkConfig {
                scan_interval_ms: env_parse("SCAN_INTERVAL", 60_000),
                scan_delay_ms: env_parse("SCAN_DELAY", 5_000),
                ping_timeout_ms: env_parse("PING_TIMEOUT", 1_000),
                ping_concurrency: env_parse("PING_CONCURRENCY", 10),
                use_ping_validation: env_bool("USE_PING_VALIDATION", true),
            },
            wake_verification: WakeVerificationConfig {
                enabled: env_bool("WAKE_VERIFY_ENABLED", true),
                timeout_ms: env_parse("WAKE_VERIFY_TIMEOUT_MS", 15_000),
                poll_interval_ms: env_parse("WAKE_VERIFY_POLL_INTERVAL_MS", 1_000),
            },
            mode,
            agent,
        };

        config.validate()?;
        Ok(config)
    }

    /// Enforce the required-field and TLS rules from §4.I.
    pub fn validate(&self) -> Result<()> {
        if self.mode == Mode::Agent {
            let agent = self
                .agent
                .as_ref()
                .ok_or_else(|| Error::Config("agent mode requires agent.* settings".into()))?;

            for (field, value) in [
                ("cncUrl", &agent.cnc_url),
                ("nodeId", &agent.node_id),
                ("location", &agent.location),
                ("authToken", &agent.auth_token),
            ] {
                if value.is_empty() {
                    return Err(Error::Config(format!(
                        "agent mode requires {field} to be set"
                    )));
                }
            }

            if self.server.env == "production" && !agent.cnc_url.starts_with("wss://") {
                return Err(Error::Config(
                    "production cncUrl must use TLS (wss://)".to_string(),
                ));
            }
        }

        let wv = &self.wake_verification;
        if !(500..=60_000).contains(&wv.timeout_ms) {
            return Err(Error::Config(
                "wakeVerification.timeoutMs must be in [500, 60000]".to_string(),
            ));
        }
        if !(100..=10_000).contains(&wv.poll_interval_ms) {
            return Err(Error::Config(
                "wakeVerification.pollIntervalMs must be in [100, 10000]".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            server: ServerConfig {
                port: 8080,
                host: "0.0.0.0".into(),
                env: "development".into(),
            },
            database: DatabaseConfig {
                path: ":memory:".into(),
            },
            network: NetworkConfig {
                scan_interval_ms: 60_000,
                scan_delay_ms: 5_000,
                ping_timeout_ms: 1_000,
                ping_concurrency: 10,
                use_ping_validation: true,
            },
            wake_verification: WakeVerificationConfig {
                enabled: true,
                timeout_ms: 15_000,
                poll_interval_ms: 1_000,
            },
            mode: Mode::Standalone,
            agent: None,
        }
    }

    #[test]
    fn standalone_mode_needs_no_agent_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn agent_mode_without_agent_config_fails() {
        let mut c = base_config();
        c.mode = Mode::Agent;
        assert!(c.validate().is_err());
    }

    #[test]
    fn agent_mode_requires_all_fields() {
        let mut c = base_config();
        c.mode = Mode::Agent;
        c.agent = Some(AgentConfig {
            cnc_url: "wss://cnc.example.com".into(),
            node_id: "".into(),
            location: "lab".into(),
            auth_token: "tok".into(),
            public_url: None,
            session_token_url: None,
            session_token_request_timeout_ms: 10_000,
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
        });
        assert!(c.validate().is_err());
    }

    #[test]
    fn production_requires_tls_cnc_url() {
        let mut c = base_config();
        c.mode = Mode::Agent;
        c.server.env = "production".into();
        c.agent = Some(AgentConfig {
            cnc_url: "ws://cnc.example.com".into(),
            node_id: "n1".into(),
            location: "lab".into(),
            auth_token: "tok".into(),
            public_url: None,
            session_token_url: None,
            session_token_request_timeout_ms: 10_000,
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
        });
        assert!(c.validate().is_err());
        c.agent.as_mut().unwrap().cnc_url = "wss://cnc.example.com".into();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn wake_verification_bounds_are_enforced() {
        let mut c = base_config();
        c.wake_verification.timeout_ms = 100;
        assert!(c.validate().is_err());
    }
}
