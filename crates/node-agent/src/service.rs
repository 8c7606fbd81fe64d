//! Agent Service (§4.F): owns the host-event buffer, pending-update
//! coalescing map, command-result buffer, and the wiring between the host
//! store's lifecycle events and the C&C transport client's send path.
//!
//! This is pure wiring with no reusable library surface, so unlike the
//! other components it lives in the binary crate rather than a library one.

use chrono::Utc;
use node_agent_core::{
    AgentConfig, CommandResultPayload, CommandType, Error, Host, HostPingDetail, HostStatus,
    LifecycleEvent, NetworkConfig, Telemetry,
};
use node_agent_store::{CommandEngine, HostStore, ScanOrchestrator};
use node_agent_transport::schema::{
    HostFramePayload, InboundFrame, OutboundFrame, UpdateHostData,
};
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cap on the command-result buffer (§4.F "bounded map... cap 250").
const RESULT_BUFFER_CAP: usize = 250;

pub struct AgentService {
    node_id: String,
    agent: AgentConfig,
    network: NetworkConfig,
    store: Arc<HostStore>,
    scan: Arc<ScanOrchestrator>,
    engine: Arc<CommandEngine>,
}

/// Bounded FIFO of outbound host-lifecycle frames, used while disconnected.
/// Overflow drops the oldest entry (§4.F "Buffering").
struct HostEventBuffer {
    cap: usize,
    queue: VecDeque<OutboundFrame>,
}

impl HostEventBuffer {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            queue: VecDeque::new(),
        }
    }

    fn push(&mut self, frame: OutboundFrame) {
        if self.queue.len() >= self.cap {
            self.queue.pop_front();
            warn!("host event buffer full, dropped oldest event");
        }
        self.queue.push_back(frame);
    }

    fn drain_batch(&mut self, batch_size: usize) -> Vec<OutboundFrame> {
        let n = batch_size.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Keyed, bounded buffer for `command-result` frames sent while
/// disconnected. Duplicate keys overwrite in place; overflow evicts the
/// oldest key (§4.F "Command result buffering").
struct ResultBuffer {
    order: VecDeque<String>,
    by_id: HashMap<String, OutboundFrame>,
}

impl ResultBuffer {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            by_id: HashMap::new(),
        }
    }

    fn insert(&mut self, command_id: String, frame: OutboundFrame) {
        if !self.by_id.contains_key(&command_id) {
            self.order.push_back(command_id.clone());
            if self.order.len() > RESULT_BUFFER_CAP {
                if let Some(oldest) = self.order.pop_front() {
                    self.by_id.remove(&oldest);
                }
            }
        }
        self.by_id.insert(command_id, frame);
    }

    fn drain_all(&mut self) -> Vec<OutboundFrame> {
        self.order
            .drain(..)
            .filter_map(|id| self.by_id.remove(&id))
            .collect()
    }
}

/// Convert a stored host into its wire shape, forcing `asleep`/unresponsive
/// when `lastSeen` is missing, unparseable, or stale (§4.F
/// "Stale-host normalisation"). Never mutates the stored record.
fn to_wire_payload(host: &Host, stale_after_ms: i64) -> HostFramePayload {
    let last_seen = host.last_seen.map(|t| t.to_rfc3339());
    let stale = match host.last_seen {
        None => true,
        Some(ts) => {
            let age_ms = (Utc::now() - ts).num_milliseconds();
            age_ms < 0 || age_ms > stale_after_ms
        }
    };

    let (status, ping_responsive) = if stale {
        ("asleep".to_string(), Some(false))
    } else {
        (host.status.to_string(), host.ping_responsive)
    };

    HostFramePayload {
        name: host.name.clone(),
        mac: host.mac.clone(),
        ip: host.ip.clone(),
        status,
        last_seen,
        discovered: host.discovered,
        ping_responsive,
    }
}

fn host_frame(kind_is_update: bool, node_id: &str, host: &Host, stale_after_ms: i64) -> OutboundFrame {
    let payload = to_wire_payload(host, stale_after_ms);
    if kind_is_update {
        OutboundFrame::HostUpdated {
            node_id: node_id.to_string(),
            host: payload,
        }
    } else {
        OutboundFrame::HostDiscovered {
            node_id: node_id.to_string(),
            host: payload,
        }
    }
}

impl AgentService {
    pub fn new(
        node_id: String,
        agent: AgentConfig,
        network: NetworkConfig,
        store: Arc<HostStore>,
        scan: Arc<ScanOrchestrator>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            node_id,
            agent,
            network,
            store,
            scan,
            engine: Arc::new(CommandEngine::new(telemetry)),
        }
    }

    /// Drive the service until `shutdown` fires. Consumes the store's
    /// lifecycle subscription and the transport client's inbound/event
    /// channels; produces frames on `outbound_tx` for the client to send.
    pub async fn run(
        self: Arc<Self>,
        mut lifecycle_rx: UnboundedReceiver<LifecycleEvent>,
        mut inbound_rx: UnboundedReceiver<InboundFrame>,
        outbound_tx: UnboundedSender<OutboundFrame>,
        mut transport_events_rx: UnboundedReceiver<node_agent_transport::TransportEvent>,
        shutdown: CancellationToken,
    ) {
        let (internal_tx, mut internal_rx) = tokio::sync::mpsc::unbounded_channel::<OutboundFrame>();

        let mut connected = false;
        let mut host_buffer = HostEventBuffer::new(self.agent.max_buffered_host_events);
        let mut result_buffer = ResultBuffer::new();
        let mut pending_updates: HashMap<String, Host> = HashMap::new();
        let mut debounce_deadline: Option<Instant> = None;

        loop {
            let debounce_sleep = match debounce_deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        deadline - now
                    } else {
                        Duration::from_millis(0)
                    }
                }
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("agent service shutting down");
                    break;
                }
                _ = tokio::time::sleep(debounce_sleep), if debounce_deadline.is_some() => {
                    debounce_deadline = None;
                    for (_, host) in pending_updates.drain() {
                        let frame = host_frame(true, &self.node_id, &host, self.agent.host_stale_after_ms);
                        Self::enqueue_or_send(frame, connected, &mut host_buffer, &outbound_tx);
                    }
                }
                event = lifecycle_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_lifecycle_event(
                        event,
                        connected,
                        &mut host_buffer,
                        &mut pending_updates,
                        &mut debounce_deadline,
                        &outbound_tx,
                    );
                }
                frame = inbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let svc = Arc::clone(&self);
                    let tx = internal_tx.clone();
                    tokio::spawn(async move { svc.dispatch_inbound(frame, tx).await; });
                }
                frame = internal_rx.recv() => {
                    let Some(frame) = frame else { continue };
                    match &frame {
                        OutboundFrame::CommandResult { command_id, .. } => {
                            let command_id = command_id.clone();
                            if connected {
                                let _ = outbound_tx.send(frame);
                            } else {
                                result_buffer.insert(command_id, frame);
                            }
                        }
                        OutboundFrame::HostRemoved { name, .. } => {
                            pending_updates.remove(name);
                            if pending_updates.is_empty() {
                                debounce_deadline = None;
                            }
                            Self::enqueue_or_send(frame, connected, &mut host_buffer, &outbound_tx);
                        }
                        _ => Self::enqueue_or_send(frame, connected, &mut host_buffer, &outbound_tx),
                    }
                }
                event = transport_events_rx.recv() => {
                    let Some(event) = event else { break };
                    if let node_agent_transport::TransportEvent::Connected { .. } = event {
                        connected = true;
                        pending_updates.clear();
                        debounce_deadline = None;
                        self.run_initial_sync(&outbound_tx, &mut host_buffer, &mut result_buffer).await;
                    } else if matches!(event, node_agent_transport::TransportEvent::Disconnected) {
                        connected = false;
                    }
                }
            }
        }

        self.scan.stop_periodic();
    }

    fn handle_lifecycle_event(
        &self,
        event: LifecycleEvent,
        connected: bool,
        host_buffer: &mut HostEventBuffer,
        pending_updates: &mut HashMap<String, Host>,
        debounce_deadline: &mut Option<Instant>,
        outbound_tx: &UnboundedSender<OutboundFrame>,
    ) {
        match event {
            LifecycleEvent::HostDiscovered(host) => {
                pending_updates.remove(&host.name);
                if pending_updates.is_empty() {
                    *debounce_deadline = None;
                }
                let frame = host_frame(false, &self.node_id, &host, self.agent.host_stale_after_ms);
                Self::enqueue_or_send(frame, connected, host_buffer, outbound_tx);
            }
            LifecycleEvent::HostUpdated(host) => {
                if pending_updates.is_empty() {
                    *debounce_deadline =
                        Some(Instant::now() + self.agent.host_update_debounce());
                }
                pending_updates.insert(host.name.clone(), host);
            }
            LifecycleEvent::HostRemoved { name } => {
                pending_updates.remove(&name);
                if pending_updates.is_empty() {
                    *debounce_deadline = None;
                }
                let frame = OutboundFrame::HostRemoved {
                    node_id: self.node_id.clone(),
                    name,
                };
                Self::enqueue_or_send(frame, connected, host_buffer, outbound_tx);
            }
            LifecycleEvent::ScanComplete { host_count } => {
                let frame = OutboundFrame::ScanComplete {
                    node_id: self.node_id.clone(),
                    host_count,
                };
                Self::enqueue_or_send(frame, connected, host_buffer, outbound_tx);
            }
        }
    }

    fn enqueue_or_send(
        frame: OutboundFrame,
        connected: bool,
        host_buffer: &mut HostEventBuffer,
        outbound_tx: &UnboundedSender<OutboundFrame>,
    ) {
        if connected {
            let _ = outbound_tx.send(frame);
        } else {
            host_buffer.push(frame);
        }
    }

    /// §4.F "Initial sync on connect": best-effort scan, flush pending
    /// updates, flush buffered command results, flush buffered host
    /// events, then replay the full host list in chunks.
    async fn run_initial_sync(
        &self,
        outbound_tx: &UnboundedSender<OutboundFrame>,
        host_buffer: &mut HostEventBuffer,
        result_buffer: &mut ResultBuffer,
    ) {
        let outcome = self.scan.sync_with_network().await;
        if !outcome.success {
            warn!(code = ?outcome.code, "pre-sync scan failed, continuing initial sync");
        }

        for frame in result_buffer.drain_all() {
            let _ = outbound_tx.send(frame);
        }

        while !host_buffer.is_empty() {
            for frame in host_buffer.drain_batch(self.agent.host_event_flush_batch_size) {
                let _ = outbound_tx.send(frame);
            }
            tokio::task::yield_now().await;
        }

        let hosts = match self.store.get_all().await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "initial sync: failed to read host list");
                return;
            }
        };

        for chunk in hosts.chunks(self.agent.initial_sync_chunk_size.max(1)) {
            for host in chunk {
                let frame = host_frame(false, &self.node_id, host, self.agent.host_stale_after_ms);
                let _ = outbound_tx.send(frame);
            }
            tokio::task::yield_now().await;
        }
    }

    async fn dispatch_inbound(&self, frame: InboundFrame, result_tx: UnboundedSender<OutboundFrame>) {
        match frame {
            InboundFrame::Wake { command_id, data } => {
                let outcome = self.run_wake(command_id.clone(), data.host_name, data.mac).await;
                self.send_command_result(command_id, outcome, &result_tx);
            }
            InboundFrame::Scan { command_id, data } => {
                let outcome = self.run_scan(command_id.clone(), data.immediate).await;
                self.send_command_result(command_id, outcome, &result_tx);
            }
            InboundFrame::UpdateHost { command_id, data } => {
                let outcome = self.run_update_host(command_id.clone(), data, &result_tx).await;
                self.send_command_result(command_id, outcome, &result_tx);
            }
            InboundFrame::DeleteHost { command_id, data } => {
                let outcome = self.run_delete_host(command_id.clone(), data.name, &result_tx).await;
                self.send_command_result(command_id, outcome, &result_tx);
            }
            InboundFrame::PingHost { command_id, data } => {
                let outcome = self
                    .run_ping_host(command_id.clone(), data.host_name, data.mac, data.ip)
                    .await;
                self.send_command_result(command_id, outcome, &result_tx);
            }
            InboundFrame::Registered { .. } | InboundFrame::Ping { .. } | InboundFrame::Error { .. } => {
                debug!("ignoring non-command inbound frame in agent service");
            }
        }
    }

    fn send_command_result(
        &self,
        command_id: String,
        result: CommandResultPayload,
        result_tx: &UnboundedSender<OutboundFrame>,
    ) {
        let frame = OutboundFrame::CommandResult {
            node_id: self.node_id.clone(),
            command_id,
            result,
            timestamp: Utc::now().timestamp_millis(),
        };
        let _ = result_tx.send(frame);
    }

    async fn run_wake(
        &self,
        command_id: String,
        host_name: String,
        mac_hint: Option<String>,
    ) -> CommandResultPayload {
        let store = Arc::clone(&self.store);
        let outcome = self
            .engine
            .execute(&command_id, CommandType::Wake, move || {
                let store = Arc::clone(&store);
                let host_name = host_name.clone();
                let mac_hint = mac_hint.clone();
                async move {
                    let host = store.get_by_name(&host_name).await?;
                    let mac = host
                        .as_ref()
                        .map(|h| h.mac.clone())
                        .or_else(|| mac_hint.clone())
                        .ok_or_else(|| {
                            Error::Validation(format!("host {host_name} has no known MAC address"))
                        })?;
                    node_agent_net::send_magic_packet(&mac).await?;
                    Ok(CommandResultPayload {
                        success: true,
                        message: Some(format!("sent Wake-on-LAN packet to {host_name}")),
                        error: None,
                        host_ping: None,
                    })
                }
            })
            .await;
        outcome.result
    }

    async fn run_scan(&self, command_id: String, immediate: bool) -> CommandResultPayload {
        let scan = Arc::clone(&self.scan);
        let outcome = self
            .engine
            .execute(&command_id, CommandType::Scan, move || {
                let scan = Arc::clone(&scan);
                async move {
                    if immediate {
                        let result = scan.sync_with_network().await;
                        Ok(CommandResultPayload {
                            success: result.success,
                            message: Some(format!(
                                "scan complete, {} hosts observed",
                                result.host_count
                            )),
                            error: result.code,
                            host_ping: None,
                        })
                    } else {
                        let background = Arc::clone(&scan);
                        tokio::spawn(async move {
                            background.sync_with_network().await;
                        });
                        Ok(CommandResultPayload {
                            success: true,
                            message: Some("Background scan scheduled".to_string()),
                            error: None,
                            host_ping: None,
                        })
                    }
                }
            })
            .await;
        outcome.result
    }

    async fn run_update_host(
        &self,
        command_id: String,
        data: UpdateHostData,
        result_tx: &UnboundedSender<OutboundFrame>,
    ) -> CommandResultPayload {
        let store = Arc::clone(&self.store);
        let patch = data.patch;
        let target_name = patch.name.clone();
        let outcome = self
            .engine
            .execute(&command_id, CommandType::UpdateHost, move || {
                let store = Arc::clone(&store);
                let patch = patch.clone();
                async move {
                    let new_name = patch
                        .name
                        .clone()
                        .ok_or_else(|| Error::Validation("update-host requires name".to_string()))?;
                    Host::validate_fields(
                        &new_name,
                        patch.mac.as_deref(),
                        patch.ip.as_deref(),
                        patch.notes.as_deref(),
                        patch.tags.as_deref().unwrap_or(&[]),
                    )?;
                    let existing_name = patch.current_name.clone().unwrap_or_else(|| new_name.clone());
                    let host = store.update(&existing_name, patch, false).await?;
                    Ok(CommandResultPayload {
                        success: true,
                        message: Some(format!("updated host {}", host.name)),
                        error: None,
                        host_ping: None,
                    })
                }
            })
            .await;

        if outcome.result.success && !outcome.is_replay {
            if let Some(name) = target_name {
                if let Ok(Some(host)) = self.store.get_by_name(&name).await {
                    let frame = OutboundFrame::HostUpdated {
                        node_id: self.node_id.clone(),
                        host: to_wire_payload(&host, self.agent.host_stale_after_ms),
                    };
                    let _ = result_tx.send(frame);
                }
            }
        }
        outcome.result
    }

    async fn run_delete_host(
        &self,
        command_id: String,
        name: String,
        result_tx: &UnboundedSender<OutboundFrame>,
    ) -> CommandResultPayload {
        let store = Arc::clone(&self.store);
        let name_for_closure = name.clone();
        let outcome = self
            .engine
            .execute(&command_id, CommandType::DeleteHost, move || {
                let store = Arc::clone(&store);
                let name = name_for_closure.clone();
                async move {
                    store.delete(&name, false).await?;
                    Ok(CommandResultPayload {
                        success: true,
                        message: Some(format!("deleted host {name}")),
                        error: None,
                        host_ping: None,
                    })
                }
            })
            .await;

        if outcome.result.success && !outcome.is_replay {
            let frame = OutboundFrame::HostRemoved {
                node_id: self.node_id.clone(),
                name,
            };
            let _ = result_tx.send(frame);
        }
        outcome.result
    }

    async fn run_ping_host(
        &self,
        command_id: String,
        host_name: String,
        mac: Option<String>,
        ip: String,
    ) -> CommandResultPayload {
        let store = Arc::clone(&self.store);
        let ping_timeout_ms = self.network.ping_timeout_ms;
        let outcome = self
            .engine
            .execute(&command_id, CommandType::PingHost, move || {
                let store = Arc::clone(&store);
                let host_name = host_name.clone();
                let mac = mac.clone();
                let ip = ip.clone();
                async move {
                    Ipv4Addr::from_str(&ip)
                        .map_err(|_| Error::Validation(format!("invalid IPv4 address: {ip}")))?;
                    let alive = node_agent_net::is_host_alive(&ip, ping_timeout_ms).await;
                    let status = if alive { HostStatus::Awake } else { HostStatus::Asleep };
                    match &mac {
                        Some(mac) => store.update_seen(mac, status, Some(alive)).await?,
                        None => store.update_status(&host_name, status).await?,
                    }
                    Ok(CommandResultPayload {
                        success: true,
                        message: Some(format!("pinged {host_name}")),
                        error: None,
                        host_ping: Some(HostPingDetail { ip, alive }),
                    })
                }
            })
            .await;
        outcome.result
    }
}
