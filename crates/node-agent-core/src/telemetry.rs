//! Runtime telemetry (§4.G): in-memory, monotonically growing counters for
//! reconnects, auth events, protocol failures, and command latencies.
//!
//! Counters are lock-free atomics: several tasks (the transport client's
//! read loop, heartbeat timer, and the command reliability engine) update
//! these fields from different points in the runtime without a shared
//! mutex.

use crate::types::CommandType;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default, Serialize, Clone, Copy)]
pub struct ReconnectCounters {
    pub scheduled: u64,
    pub failed: u64,
}

#[derive(Debug, Default, Serialize, Clone, Copy)]
pub struct AuthCounters {
    pub expired: u64,
    pub revoked: u64,
    pub unavailable: u64,
}

#[derive(Debug, Default, Serialize, Clone, Copy)]
pub struct ProtocolCounters {
    pub inbound_validation_failures: u64,
    pub outbound_validation_failures: u64,
    pub unsupported: u64,
    pub errors: u64,
}

/// Latency/success bucket, either aggregated over all commands or scoped to
/// one [`CommandType`] in [`TelemetrySnapshot::commands_by_type`].
#[derive(Debug, Default, Serialize, Clone, Copy)]
pub struct CommandBucket {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub avg_latency_ms: u64,
    pub last_latency_ms: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct TelemetrySnapshot {
    pub reconnect: ReconnectCounters,
    pub auth: AuthCounters,
    pub protocol: ProtocolCounters,
    pub commands: CommandBucket,
    pub commands_by_type: HashMap<CommandType, CommandBucket>,
}

struct LatencyAccumulator {
    count: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    sum_ms: AtomicU64,
    last_ms: AtomicI64,
}

impl Default for LatencyAccumulator {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
            last_ms: AtomicI64::new(0),
        }
    }
}

impl LatencyAccumulator {
    fn record(&self, success: bool, latency_ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.last_ms.store(latency_ms as i64, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.success.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.sum_ms.store(0, Ordering::Relaxed);
        self.last_ms.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CommandBucket {
        let total = self.count.load(Ordering::Relaxed);
        let avg = if total == 0 {
            0
        } else {
            self.sum_ms.load(Ordering::Relaxed) / total
        };
        CommandBucket {
            total,
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_latency_ms: avg,
            last_latency_ms: self.last_ms.load(Ordering::Relaxed).max(0) as u64,
        }
    }
}

/// Thread-safe counter set for one running agent process. `reset` zeros
/// every field; there is no persistence across process restarts (§4.G).
pub struct Telemetry {
    reconnect_scheduled: AtomicU64,
    reconnect_failed: AtomicU64,
    auth_expired: AtomicU64,
    auth_revoked: AtomicU64,
    auth_unavailable: AtomicU64,
    protocol_inbound_failures: AtomicU64,
    protocol_outbound_failures: AtomicU64,
    protocol_unsupported: AtomicU64,
    protocol_errors: AtomicU64,
    commands_overall: LatencyAccumulator,
    commands_by_type: Mutex<HashMap<CommandType, LatencyAccumulator>>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            reconnect_scheduled: AtomicU64::new(0),
            reconnect_failed: AtomicU64::new(0),
            auth_expired: AtomicU64::new(0),
            auth_revoked: AtomicU64::new(0),
            auth_unavailable: AtomicU64::new(0),
            protocol_inbound_failures: AtomicU64::new(0),
            protocol_outbound_failures: AtomicU64::new(0),
            protocol_unsupported: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            commands_overall: LatencyAccumulator::default(),
            commands_by_type: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_reconnect_scheduled(&self) {
        self.reconnect_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_failed(&self) {
        self.reconnect_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_expired(&self) {
        self.auth_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_revoked(&self) {
        self.auth_revoked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_unavailable(&self) {
        self.auth_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inbound_validation_failure(&self) {
        self.protocol_inbound_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outbound_validation_failure(&self) {
        self.protocol_outbound_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_unsupported(&self) {
        self.protocol_unsupported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminal command outcome. Replays (§4.D, §8: "counters do
    /// not advance") must not call this a second time for the same
    /// command id — callers are responsible for that idempotency check.
    pub fn record_command(&self, command_type: CommandType, success: bool, latency_ms: u64) {
        self.commands_overall.record(success, latency_ms);
        self.commands_by_type
            .lock()
            .entry(command_type)
            .or_default()
            .record(success, latency_ms);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let commands_by_type = self
            .commands_by_type
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.snapshot()))
            .collect();

        TelemetrySnapshot {
            reconnect: ReconnectCounters {
                scheduled: self.reconnect_scheduled.load(Ordering::Relaxed),
                failed: self.reconnect_failed.load(Ordering::Relaxed),
            },
            auth: AuthCounters {
                expired: self.auth_expired.load(Ordering::Relaxed),
                revoked: self.auth_revoked.load(Ordering::Relaxed),
                unavailable: self.auth_unavailable.load(Ordering::Relaxed),
            },
            protocol: ProtocolCounters {
                inbound_validation_failures: self.protocol_inbound_failures.load(Ordering::Relaxed),
                outbound_validation_failures: self
                    .protocol_outbound_failures
                    .load(Ordering::Relaxed),
                unsupported: self.protocol_unsupported.load(Ordering::Relaxed),
                errors: self.protocol_errors.load(Ordering::Relaxed),
            },
            commands: self.commands_overall.snapshot(),
            commands_by_type,
        }
    }

    /// Zero every counter. Used in tests and optionally exposed to
    /// operators via a future management endpoint (out of scope here).
    pub fn reset(&self) {
        for counter in [
            &self.reconnect_scheduled,
            &self.reconnect_failed,
            &self.auth_expired,
            &self.auth_revoked,
            &self.auth_unavailable,
            &self.protocol_inbound_failures,
            &self.protocol_outbound_failures,
            &self.protocol_unsupported,
            &self.protocol_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.commands_overall.reset();
        self.commands_by_type.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_average_with_zero_samples_is_zero() {
        let t = Telemetry::new();
        assert_eq!(t.snapshot().commands.avg_latency_ms, 0);
    }

    #[test]
    fn command_recording_updates_overall_and_per_type() {
        let t = Telemetry::new();
        t.record_command(CommandType::Wake, true, 120);
        t.record_command(CommandType::Wake, false, 80);
        let snap = t.snapshot();
        assert_eq!(snap.commands.total, 2);
        assert_eq!(snap.commands.success, 1);
        assert_eq!(snap.commands.failed, 1);
        assert_eq!(snap.commands.avg_latency_ms, 100);
        let wake = snap.commands_by_type.get(&CommandType::Wake).unwrap();
        assert_eq!(wake.total, 2);
    }

    #[test]
    fn counters_are_monotonic_until_explicit_reset() {
        let t = Telemetry::new();
        t.record_reconnect_scheduled();
        t.record_reconnect_scheduled();
        assert_eq!(t.snapshot().reconnect.scheduled, 2);
    }
}
