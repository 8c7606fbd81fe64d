//! Core data model: [`Host`], discovery and command-execution records, and
//! the session token held by the C&C transport client.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::OnceLock;

fn mac_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9A-Fa-f]{1,2}:){5}[0-9A-Fa-f]{1,2}$").unwrap())
}

/// Canonicalise a MAC address to uppercase, colon-separated, zero-padded
/// octets (`AA:BB:CC:DD:EE:FF`). Accepts 1-2 hex digits per octet and `-` or
/// `:` separators so short/Windows-formatted input round-trips.
///
/// `format_mac(format_mac(x)) == format_mac(x)` for any valid input.
pub fn format_mac(input: &str) -> Result<String> {
    let normalized = input.replace('-', ":");
    if !mac_regex().is_match(&normalized) {
        return Err(Error::Validation(format!("invalid MAC address: {input}")));
    }
    let octets: Vec<String> = normalized
        .split(':')
        .map(|o| format!("{:02X}", u8::from_str_radix(o, 16).unwrap()))
        .collect();
    Ok(octets.join(":"))
}

/// Host power status as tracked by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Awake,
    Asleep,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostStatus::Awake => write!(f, "awake"),
            HostStatus::Asleep => write!(f, "asleep"),
        }
    }
}

/// The central entity: a host tracked by name, MAC, and IP.
///
/// Identity is by `name` (unique, 1-255 chars); `mac` and `ip` are each also
/// unique. `mac` is always stored canonicalised via [`format_mac`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub mac: String,
    pub ip: String,
    pub status: HostStatus,
    pub last_seen: Option<DateTime<Utc>>,
    /// `false` if manually added, `true` if first observed by a scan.
    pub discovered: bool,
    pub ping_responsive: Option<bool>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

/// Fields accepted when adding a host, distinct from [`Host`] because
/// `status`/`last_seen`/`discovered` are derived by the store on insert.
#[derive(Debug, Clone, Default)]
pub struct NewHost {
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

/// Partial update applied to an existing host. `None` fields are left
/// unchanged; `current_name` is present only when the update also renames
/// the host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPatch {
    pub current_name: Option<String>,
    pub name: Option<String>,
    pub mac: Option<String>,
    pub ip: Option<String>,
    pub status: Option<HostStatus>,
    pub notes: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl Host {
    /// Validate the fixed-size invariants from §3: name length, MAC/IPv4
    /// form, notes length, and tag count/length. Does not check uniqueness,
    /// which is a store-level concern enforced at write time.
    pub fn validate_fields(
        name: &str,
        mac: Option<&str>,
        ip: Option<&str>,
        notes: Option<&str>,
        tags: &[String],
    ) -> Result<()> {
        if name.is_empty() || name.len() > 255 {
            return Err(Error::Validation(
                "name must be 1-255 characters".to_string(),
            ));
        }
        if let Some(mac) = mac {
            format_mac(mac)?;
        }
        if let Some(ip) = ip {
            Ipv4Addr::from_str(ip)
                .map_err(|_| Error::Validation(format!("invalid IPv4 address: {ip}")))?;
        }
        if let Some(notes) = notes {
            if notes.len() > 2000 {
                return Err(Error::Validation("notes must be <= 2000 chars".to_string()));
            }
        }
        if tags.len() > 32 {
            return Err(Error::Validation("at most 32 tags are allowed".to_string()));
        }
        for tag in tags {
            if tag.is_empty() || tag.len() > 64 {
                return Err(Error::Validation(
                    "each tag must be 1-64 characters".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Transient tuple produced by network discovery (§4.B), not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub ip: String,
    pub mac: String,
    pub hostname: Option<String>,
}

/// Outcome of waking a host and polling for it to come online (§4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeVerificationStatus {
    NotRequested,
    Woke,
    Timeout,
    NotConfirmed,
    HostNotFound,
    Error,
}

/// Where a `Woke` verdict was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeSource {
    Database,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeVerificationResult {
    pub enabled: bool,
    pub status: WakeVerificationStatus,
    pub attempts: u32,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub elapsed_ms: u64,
    pub last_observed_status: Option<HostStatus>,
    pub source: Option<WakeSource>,
    pub message: Option<String>,
}

/// Parameters accepted at the wake-verification request boundary.
/// `timeout_ms` must be in `[500, 60000]`, `poll_interval_ms` in
/// `[100, 10000]`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WakeVerificationParams {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl WakeVerificationParams {
    pub fn validate(&self) -> Result<()> {
        if !(500..=60_000).contains(&self.timeout_ms) {
            return Err(Error::Validation(
                "wake verify timeoutMs must be in [500, 60000]".to_string(),
            ));
        }
        if !(100..=10_000).contains(&self.poll_interval_ms) {
            return Err(Error::Validation(
                "wake verify pollIntervalMs must be in [100, 10000]".to_string(),
            ));
        }
        Ok(())
    }
}

/// State machine for a single dispatched command (§3, §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Queued,
    Sent,
    Acknowledged,
    Failed,
    TimedOut,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Acknowledged | CommandState::Failed | CommandState::TimedOut
        )
    }
}

/// Which inbound command kind produced this record; drives the per-type
/// retry policy in §4.D's authoritative table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    Wake,
    Scan,
    UpdateHost,
    DeleteHost,
    PingHost,
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandType::Wake => "wake",
            CommandType::Scan => "scan",
            CommandType::UpdateHost => "update-host",
            CommandType::DeleteHost => "delete-host",
            CommandType::PingHost => "ping-host",
        };
        write!(f, "{s}")
    }
}

/// Outcome handed from a command closure to the reliability engine, and
/// ultimately serialised into an outbound `command-result` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultPayload {
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub host_ping: Option<HostPingDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPingDetail {
    pub ip: String,
    pub alive: bool,
}

/// Ledger entry tracked by the command reliability engine, keyed by
/// `command_id`. Terminal entries are replayed verbatim on duplicate
/// delivery (§3, §8).
#[derive(Debug, Clone)]
pub struct CommandExecutionRecord {
    pub command_id: String,
    pub command_type: CommandType,
    pub state: CommandState,
    pub attempts: u32,
    pub received_at_ms: i64,
    pub updated_at_ms: i64,
    pub last_error: Option<String>,
    pub result: Option<CommandResultPayload>,
}

/// Bearer token minted for (or configured as) the C&C session, held only
/// in memory (§3, §9).
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub token: String,
    pub expires_at_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_mac_canonicalises() {
        assert_eq!(
            format_mac("aa:bb:cc:dd:ee:ff").unwrap(),
            "AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(format_mac("a:b:c:d:e:f").unwrap(), "0A:0B:0C:0D:0E:0F");
        assert_eq!(
            format_mac("AA-BB-CC-DD-EE-FF").unwrap(),
            "AA:BB:CC:DD:EE:FF"
        );
    }

    #[test]
    fn format_mac_is_idempotent() {
        let once = format_mac("aa:b:cc:dd:ee:ff").unwrap();
        let twice = format_mac(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn format_mac_rejects_garbage() {
        assert!(format_mac("not-a-mac").is_err());
        assert!(format_mac("aa:bb:cc:dd:ee").is_err());
    }

    #[test]
    fn host_validate_fields_enforces_limits() {
        assert!(Host::validate_fields("", None, None, None, &[]).is_err());
        let long_name = "x".repeat(256);
        assert!(Host::validate_fields(&long_name, None, None, None, &[]).is_err());
        assert!(Host::validate_fields("ok", Some("zz"), None, None, &[]).is_err());
        assert!(Host::validate_fields("ok", None, Some("999.1.1.1"), None, &[]).is_err());
        let too_many_tags: Vec<String> = (0..33).map(|i| i.to_string()).collect();
        assert!(Host::validate_fields("ok", None, None, None, &too_many_tags).is_err());
    }

    #[test]
    fn wake_verification_params_bounds() {
        assert!(WakeVerificationParams {
            enabled: true,
            timeout_ms: 499,
            poll_interval_ms: 200,
        }
        .validate()
        .is_err());
        assert!(WakeVerificationParams {
            enabled: true,
            timeout_ms: 60_001,
            poll_interval_ms: 200,
        }
        .validate()
        .is_err());
        assert!(WakeVerificationParams {
            enabled: true,
            timeout_ms: 5000,
            poll_interval_ms: 50,
        }
        .validate()
        .is_err());
        assert!(WakeVerificationParams {
            enabled: true,
            timeout_ms: 5000,
            poll_interval_ms: 500,
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn command_state_terminality() {
        assert!(!CommandState::Queued.is_terminal());
        assert!(!CommandState::Sent.is_terminal());
        assert!(CommandState::Acknowledged.is_terminal());
        assert!(CommandState::Failed.is_terminal());
        assert!(CommandState::TimedOut.is_terminal());
    }
}
