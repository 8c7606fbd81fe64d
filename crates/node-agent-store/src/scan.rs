//! Scan Orchestrator (§4.C): serialises scans, reconciles ARP/ICMP
//! discovery output into the store, and emits summary lifecycle events.

use crate::error::StoreResult;
use crate::store::HostStore;
use chrono::{DateTime, Utc};
use node_agent_core::HostStatus;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one `syncWithNetwork` call (§4.C).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub success: bool,
    pub code: Option<String>,
    pub host_count: usize,
}

pub const SCAN_IN_PROGRESS: &str = "SCAN_IN_PROGRESS";

/// Tuning knobs the scan orchestrator needs from `NetworkConfig` (§4.I);
/// kept as a plain struct here so this crate doesn't depend on
/// `node-agent`'s CLI wiring.
#[derive(Debug, Clone, Copy)]
pub struct ScanSettings {
    pub ping_timeout_ms: u64,
    pub ping_concurrency: usize,
    pub use_ping_validation: bool,
}

struct ReleaseGuard<'a> {
    orchestrator: &'a ScanOrchestrator,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        *self.orchestrator.last_scan_time.lock() = Some(Utc::now());
        self.orchestrator.in_progress.store(false, Ordering::SeqCst);
    }
}

pub struct ScanOrchestrator {
    store: Arc<HostStore>,
    settings: ScanSettings,
    in_progress: Arc<AtomicBool>,
    last_scan_time: Arc<Mutex<Option<DateTime<Utc>>>>,
    periodic_task: Mutex<Option<JoinHandle<()>>>,
}

fn device_name(ip: &str) -> String {
    format!("device-{}", ip.replace('.', "-"))
}

impl ScanOrchestrator {
    pub fn new(store: Arc<HostStore>, settings: ScanSettings) -> Self {
        Self {
            store,
            settings,
            in_progress: Arc::new(AtomicBool::new(false)),
            last_scan_time: Arc::new(Mutex::new(None)),
            periodic_task: Mutex::new(None),
        }
    }

    pub fn is_scan_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn get_last_scan_time(&self) -> Option<DateTime<Utc>> {
        *self.last_scan_time.lock()
    }

    /// Run one discovery + reconciliation pass. At most one scan runs at a
    /// time; a concurrent call returns immediately with `SCAN_IN_PROGRESS`
    /// (§4.C) without touching `lastScanTime`.
    pub async fn sync_with_network(&self) -> ScanOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return ScanOutcome {
                success: false,
                code: Some(SCAN_IN_PROGRESS.to_string()),
                host_count: 0,
            };
        }
        let _guard = ReleaseGuard { orchestrator: self };

        let discovered = match node_agent_net::scan_arp().await {
            Ok(hosts) => hosts,
            Err(e) => {
                // Open question (a): the source emits no event on exception.
                warn!(error = %e, "arp scan failed");
                return ScanOutcome {
                    success: false,
                    code: None,
                    host_count: 0,
                };
            }
        };

        if discovered.is_empty() {
            let count = self.store.count().await.unwrap_or(0) as usize;
            self.store.emit_scan_complete(count);
            return ScanOutcome {
                success: true,
                code: None,
                host_count: 0,
            };
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.ping_concurrency.max(1)));
        let timeout_ms = self.settings.ping_timeout_ms;
        let mut probes = Vec::with_capacity(discovered.len());
        for host in &discovered {
            let permit = semaphore.clone().acquire_owned().await.unwrap();
            let ip = host.ip.clone();
            probes.push(tokio::spawn(async move {
                let alive = node_agent_net::is_host_alive(&ip, timeout_ms).await;
                drop(permit);
                alive
            }));
        }

        let mut ping_results = Vec::with_capacity(probes.len());
        for handle in probes {
            ping_results.push(handle.await.unwrap_or(false));
        }

        for (host, ping_responsive) in discovered.into_iter().zip(ping_results) {
            let status = if self.settings.use_ping_validation {
                if ping_responsive {
                    HostStatus::Awake
                } else {
                    HostStatus::Asleep
                }
            } else {
                HostStatus::Awake
            };

            if let Err(e) = self
                .store
                .update_seen(&host.mac, status, Some(ping_responsive))
                .await
            {
                debug!(mac = %host.mac, error = %e, "unknown host, registering");
                let name = host
                    .hostname
                    .clone()
                    .unwrap_or_else(|| device_name(&host.ip));

                if let Err(add_err) = self
                    .store
                    .add_suppressed(&name, &host.mac, &host.ip)
                    .await
                {
                    warn!(name, error = %add_err, "failed to register discovered host");
                    continue;
                }
                if let Err(e) = self.store.update_status(&name, status).await {
                    warn!(name, error = %e, "failed to set status for new host");
                }
                if let Err(e) = self
                    .store
                    .update_seen(&host.mac, status, Some(ping_responsive))
                    .await
                {
                    warn!(name, error = %e, "failed to record seen for new host");
                }
                if let Ok(Some(new_host)) = self.store.get_by_name(&name).await {
                    self.store.emit_host_discovered(new_host);
                }
            }
        }

        let count = match self.store.count().await {
            Ok(c) => c as usize,
            Err(_) => 0,
        };
        self.store.emit_scan_complete(count);

        ScanOutcome {
            success: true,
            code: None,
            host_count: count,
        }
    }

    /// Start periodic scanning. If `immediate`, the first scan runs
    /// synchronously in a detached task before the ticker starts; otherwise
    /// the first scan is deferred by `scan_delay_ms`. Overlap is impossible
    /// because each tick goes through [`Self::sync_with_network`]'s mutual
    /// exclusion.
    pub fn start_periodic(self: &Arc<Self>, interval_ms: u64, scan_delay_ms: u64, immediate: bool) {
        self.stop_periodic();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if immediate {
                this.sync_with_network().await;
            } else {
                tokio::time::sleep(Duration::from_millis(scan_delay_ms)).await;
                this.sync_with_network().await;
            }
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            ticker.tick().await; // consume the immediate first tick
            loop {
                ticker.tick().await;
                this.sync_with_network().await;
            }
        });
        *self.periodic_task.lock() = Some(handle);
        info!(interval_ms, scan_delay_ms, immediate, "periodic scan started");
    }

    pub fn stop_periodic(&self) {
        if let Some(handle) = self.periodic_task.lock().take() {
            handle.abort();
            info!("periodic scan stopped");
        }
    }

    pub async fn host_count(&self) -> StoreResult<i64> {
        self.store.count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_name_replaces_dots_with_dashes() {
        assert_eq!(device_name("192.168.1.10"), "device-192-168-1-10");
    }

    #[tokio::test]
    async fn concurrent_scan_returns_in_progress_code() {
        let store = Arc::new(
            HostStore::open(":memory:", node_agent_core::LifecycleBus::new())
                .await
                .unwrap(),
        );
        let orchestrator = Arc::new(ScanOrchestrator::new(
            store,
            ScanSettings {
                ping_timeout_ms: 100,
                ping_concurrency: 4,
                use_ping_validation: true,
            },
        ));
        orchestrator.in_progress.store(true, Ordering::SeqCst);
        let outcome = orchestrator.sync_with_network().await;
        assert!(!outcome.success);
        assert_eq!(outcome.code.as_deref(), Some(SCAN_IN_PROGRESS));
    }
}
