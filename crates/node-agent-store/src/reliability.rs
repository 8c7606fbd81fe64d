//! Command Reliability Engine (§4.D): per-command-type timeout, bounded
//! retry, idempotent de-duplication, state machine, and result retention.

use node_agent_core::{
    CommandResultPayload, CommandState, CommandType, Error, Result, Telemetry,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, info, warn};

/// Retention limits (§4.D "Pruning").
const RETENTION: Duration = Duration::from_secs(30 * 60);
const MAX_RECORDS: usize = 500;

/// The authoritative per-command-type policy table (§4.D).
#[derive(Debug, Clone, Copy)]
pub struct CommandPolicy {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_on_failure: bool,
}

pub fn policy_for(command_type: CommandType) -> CommandPolicy {
    match command_type {
        CommandType::Wake => CommandPolicy {
            timeout_ms: 7_500,
            max_attempts: 2,
            retry_delay_ms: 250,
            retry_on_failure: true,
        },
        CommandType::Scan => CommandPolicy {
            timeout_ms: 90_000,
            max_attempts: 1,
            retry_delay_ms: 0,
            retry_on_failure: false,
        },
        CommandType::UpdateHost | CommandType::DeleteHost | CommandType::PingHost => {
            CommandPolicy {
                timeout_ms: 5_000,
                max_attempts: 1,
                retry_delay_ms: 200,
                retry_on_failure: false,
            }
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedRecord {
    command_type: CommandType,
    state: CommandState,
    attempts: u32,
    received_at: Instant,
    updated_at: Instant,
    last_error: Option<String>,
    result: Option<CommandResultPayload>,
}

/// Outcome handed back to the caller after `execute` returns: either the
/// freshly produced terminal result, or a replayed one (telemetry is not
/// re-counted for replays, per §8).
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub result: CommandResultPayload,
    pub is_replay: bool,
}

pub struct CommandEngine {
    telemetry: Arc<Telemetry>,
    records: Mutex<HashMap<String, TrackedRecord>>,
}

impl CommandEngine {
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        Self {
            telemetry,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Execute `command_id` of `command_type` via the idempotent closure
    /// `do_work`, applying the per-type timeout/retry policy. Exactly one
    /// terminal result is produced per command id in a process lifetime;
    /// duplicate deliveries of an already-terminal command replay the
    /// cached result without re-executing or re-counting telemetry.
    pub async fn execute<F, Fut>(
        &self,
        command_id: &str,
        command_type: CommandType,
        do_work: F,
    ) -> ExecutionOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<CommandResultPayload>>,
    {
        if let Some(existing) = self.records.lock().get(command_id).cloned() {
            if existing.state.is_terminal() {
                if let Some(result) = existing.result {
                    info!(command_id, "replaying cached terminal command result");
                    return ExecutionOutcome {
                        result,
                        is_replay: true,
                    };
                }
            } else {
                debug!(command_id, "duplicate delivery of in-flight command, dropping");
                return ExecutionOutcome {
                    result: CommandResultPayload {
                        success: false,
                        message: None,
                        error: Some("command already in flight".to_string()),
                        host_ping: None,
                    },
                    is_replay: true,
                };
            }
        }

        let policy = policy_for(command_type);
        self.upsert(command_id, command_type, CommandState::Queued, 0, None, None);

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            self.upsert(command_id, command_type, CommandState::Sent, attempts, None, None);

            let attempt_result = match tokio_timeout(
                Duration::from_millis(policy.timeout_ms),
                do_work(),
            )
            .await
            {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::Timeout(format!(
                    "command {command_id} timed out after {}ms",
                    policy.timeout_ms
                ))),
            };

            match attempt_result {
                Ok(payload) if payload.success => break (CommandState::Acknowledged, Ok(payload)),
                Ok(payload) => {
                    if policy.retry_on_failure && attempts < policy.max_attempts {
                        self.sleep_retry(policy.retry_delay_ms).await;
                        continue;
                    }
                    break (CommandState::Failed, Ok(payload));
                }
                Err(e) => {
                    let is_timeout = matches!(e, Error::Timeout(_));
                    if e.is_retryable() && attempts < policy.max_attempts {
                        self.sleep_retry(policy.retry_delay_ms).await;
                        continue;
                    }
                    let state = if is_timeout {
                        CommandState::TimedOut
                    } else {
                        CommandState::Failed
                    };
                    break (state, Err(e));
                }
            }
        };

        let (final_state, final_result) = outcome;
        let payload = match final_result {
            Ok(payload) => payload,
            Err(e) => CommandResultPayload {
                success: false,
                message: None,
                error: Some(e.to_string()),
                host_ping: None,
            },
        };

        self.upsert(
            command_id,
            command_type,
            final_state,
            attempts,
            payload.error.clone(),
            Some(payload.clone()),
        );

        let latency_ms = self
            .records
            .lock()
            .get(command_id)
            .map(|r| r.updated_at.duration_since(r.received_at).as_millis() as u64)
            .unwrap_or(0);
        self.telemetry
            .record_command(command_type, payload.success, latency_ms);

        self.prune();

        ExecutionOutcome {
            result: payload,
            is_replay: false,
        }
    }

    async fn sleep_retry(&self, delay_ms: u64) {
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    fn upsert(
        &self,
        command_id: &str,
        command_type: CommandType,
        state: CommandState,
        attempts: u32,
        last_error: Option<String>,
        result: Option<CommandResultPayload>,
    ) {
        let now = Instant::now();
        let mut records = self.records.lock();
        let entry = records
            .entry(command_id.to_string())
            .or_insert_with(|| TrackedRecord {
                command_type,
                state,
                attempts: 0,
                received_at: now,
                updated_at: now,
                last_error: None,
                result: None,
            });
        entry.state = state;
        entry.attempts = attempts;
        entry.updated_at = now;
        if last_error.is_some() {
            entry.last_error = last_error;
        }
        if result.is_some() {
            entry.result = result;
        }
        if state.is_terminal() {
            info!(command_id, ?state, attempts, "command reached terminal state");
        } else {
            debug!(command_id, ?state, attempts, "command state transition");
        }
    }

    /// Evict terminal records older than the retention window; if the
    /// table still exceeds the count ceiling, evict terminal ones
    /// oldest-first, then any state oldest-first (§4.D).
    fn prune(&self) {
        let mut records = self.records.lock();
        let now = Instant::now();
        records.retain(|_, r| !(r.state.is_terminal() && now.duration_since(r.updated_at) > RETENTION));

        if records.len() > MAX_RECORDS {
            let mut ids: Vec<(String, Instant, bool)> = records
                .iter()
                .map(|(id, r)| (id.clone(), r.updated_at, r.state.is_terminal()))
                .collect();
            ids.sort_by(|a, b| b.2.cmp(&a.2).then(a.1.cmp(&b.1)));
            let overflow = records.len() - MAX_RECORDS;
            for (id, _, _) in ids.into_iter().take(overflow) {
                records.remove(&id);
                warn!(command_id = %id, "evicted command record, table over capacity");
            }
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn success_payload() -> CommandResultPayload {
        CommandResultPayload {
            success: true,
            message: Some("ok".to_string()),
            error: None,
            host_ping: None,
        }
    }

    #[tokio::test]
    async fn first_call_executes_and_records_success() {
        let engine = CommandEngine::new(Arc::new(Telemetry::new()));
        let outcome = engine
            .execute("c1", CommandType::PingHost, || async { Ok(success_payload()) })
            .await;
        assert!(outcome.result.success);
        assert!(!outcome.is_replay);
    }

    #[tokio::test]
    async fn duplicate_terminal_delivery_replays_without_recounting() {
        let engine = CommandEngine::new(Arc::new(Telemetry::new()));
        engine
            .execute("c1", CommandType::PingHost, || async { Ok(success_payload()) })
            .await;
        let snap_before = engine.telemetry.snapshot().commands.total;

        let replay = engine
            .execute("c1", CommandType::PingHost, || async {
                panic!("must not re-execute")
            })
            .await;
        assert!(replay.is_replay);
        assert!(replay.result.success);
        assert_eq!(engine.telemetry.snapshot().commands.total, snap_before);
    }

    #[tokio::test]
    async fn wake_retries_on_non_retryable_false_is_not_retried_without_flag() {
        // update-host/delete-host/ping-host have retry_on_failure = false
        let engine = CommandEngine::new(Arc::new(Telemetry::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let outcome = engine
            .execute("c1", CommandType::PingHost, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CommandResultPayload {
                        success: false,
                        message: None,
                        error: Some("nope".to_string()),
                        host_ping: None,
                    })
                }
            })
            .await;
        assert!(!outcome.result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wake_retries_twice_on_failure_then_terminal() {
        let engine = CommandEngine::new(Arc::new(Telemetry::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let outcome = engine
            .execute("w1", CommandType::Wake, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CommandResultPayload {
                        success: false,
                        message: None,
                        error: Some("wol hung".to_string()),
                        host_ping: None,
                    })
                }
            })
            .await;
        assert!(!outcome.result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 2, "wake allows 2 attempts");
    }

    #[tokio::test]
    async fn non_retryable_validation_error_terminates_immediately() {
        let engine = CommandEngine::new(Arc::new(Telemetry::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let outcome = engine
            .execute("v1", CommandType::Wake, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Validation("bad payload".to_string()))
                }
            })
            .await;
        assert!(!outcome.result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
