//! Wake Verification (§4.H): after a magic packet is sent, poll the store
//! and then ICMP until the host is observed awake or the deadline passes.

use crate::store::HostStore;
use node_agent_core::{
    HostStatus, WakeSource, WakeVerificationParams, WakeVerificationResult, WakeVerificationStatus,
};
use std::time::{Duration, Instant};
use tracing::debug;

/// Run the poll loop described in §4.H against `host_name`.
pub async fn verify_wake(
    store: &HostStore,
    host_name: &str,
    params: WakeVerificationParams,
) -> WakeVerificationResult {
    let start = Instant::now();
    let deadline = start + Duration::from_millis(params.timeout_ms);

    if !params.enabled {
        return WakeVerificationResult {
            enabled: false,
            status: WakeVerificationStatus::NotRequested,
            attempts: 0,
            timeout_ms: params.timeout_ms,
            poll_interval_ms: params.poll_interval_ms,
            elapsed_ms: 0,
            last_observed_status: None,
            source: None,
            message: None,
        };
    }

    let mut attempts = 0u32;
    loop {
        attempts += 1;

        let host = match store.get_by_name(host_name).await {
            Ok(Some(host)) => host,
            Ok(None) => {
                return finish(
                    WakeVerificationStatus::HostNotFound,
                    attempts,
                    start,
                    params,
                    None,
                    None,
                    Some(format!("host {host_name} not found")),
                );
            }
            Err(e) => {
                return finish(
                    WakeVerificationStatus::Error,
                    attempts,
                    start,
                    params,
                    None,
                    None,
                    Some(e.to_string()),
                );
            }
        };

        if host.status == HostStatus::Awake {
            return finish(
                WakeVerificationStatus::Woke,
                attempts,
                start,
                params,
                Some(HostStatus::Awake),
                Some(WakeSource::Database),
                None,
            );
        }

        if host.ip.is_empty() {
            return finish(
                WakeVerificationStatus::NotConfirmed,
                attempts,
                start,
                params,
                Some(host.status),
                None,
                Some("host has no IP recorded".to_string()),
            );
        }

        let alive = node_agent_net::is_host_alive(&host.ip, params.poll_interval_ms).await;
        if alive {
            return finish(
                WakeVerificationStatus::Woke,
                attempts,
                start,
                params,
                Some(host.status),
                Some(WakeSource::Ping),
                None,
            );
        }

        let now = Instant::now();
        if now >= deadline {
            return finish(
                WakeVerificationStatus::Timeout,
                attempts,
                start,
                params,
                Some(host.status),
                None,
                None,
            );
        }

        let remaining = deadline - now;
        let sleep_for = Duration::from_millis(params.poll_interval_ms).min(remaining);
        debug!(host_name, attempts, ?sleep_for, "wake not confirmed yet, polling again");
        tokio::time::sleep(sleep_for).await;
    }
}

#[allow(clippy::too_many_arguments)]
fn finish(
    status: WakeVerificationStatus,
    attempts: u32,
    start: Instant,
    params: WakeVerificationParams,
    last_observed_status: Option<HostStatus>,
    source: Option<WakeSource>,
    message: Option<String>,
) -> WakeVerificationResult {
    WakeVerificationResult {
        enabled: true,
        status,
        attempts,
        timeout_ms: params.timeout_ms,
        poll_interval_ms: params.poll_interval_ms,
        elapsed_ms: start.elapsed().as_millis() as u64,
        last_observed_status,
        source,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_agent_core::{LifecycleBus, NewHost};

    #[tokio::test]
    async fn disabled_short_circuits_to_not_requested() {
        let store = HostStore::open(":memory:", LifecycleBus::new()).await.unwrap();
        let result = verify_wake(
            &store,
            "anything",
            WakeVerificationParams {
                enabled: false,
                timeout_ms: 1000,
                poll_interval_ms: 100,
            },
        )
        .await;
        assert_eq!(result.status, WakeVerificationStatus::NotRequested);
        assert!(!result.enabled);
    }

    #[tokio::test]
    async fn missing_host_reports_host_not_found() {
        let store = HostStore::open(":memory:", LifecycleBus::new()).await.unwrap();
        let result = verify_wake(
            &store,
            "GHOST",
            WakeVerificationParams {
                enabled: true,
                timeout_ms: 500,
                poll_interval_ms: 100,
            },
        )
        .await;
        assert_eq!(result.status, WakeVerificationStatus::HostNotFound);
    }

    #[tokio::test]
    async fn already_awake_host_resolves_immediately_from_database() {
        let store = HostStore::open(":memory:", LifecycleBus::new()).await.unwrap();
        store
            .add("PHANTOM", "AA:BB:CC:DD:EE:FF", "192.168.1.10", NewHost::default())
            .await
            .unwrap();
        store
            .update_status("PHANTOM", HostStatus::Awake)
            .await
            .unwrap();

        let result = verify_wake(
            &store,
            "PHANTOM",
            WakeVerificationParams {
                enabled: true,
                timeout_ms: 1000,
                poll_interval_ms: 100,
            },
        )
        .await;
        assert_eq!(result.status, WakeVerificationStatus::Woke);
        assert_eq!(result.source, Some(WakeSource::Database));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn asleep_host_with_unreachable_ip_times_out() {
        let store = HostStore::open(":memory:", LifecycleBus::new()).await.unwrap();
        store
            .add("PHANTOM", "AA:BB:CC:DD:EE:FF", "203.0.113.1", NewHost::default())
            .await
            .unwrap();

        let result = verify_wake(
            &store,
            "PHANTOM",
            WakeVerificationParams {
                enabled: true,
                timeout_ms: 500,
                poll_interval_ms: 100,
            },
        )
        .await;
        assert_eq!(result.status, WakeVerificationStatus::Timeout);
    }
}
