//! C&C Transport Client (§4.E): a long-lived framed duplex WebSocket
//! connection to the C&C service, with session-token auth, a registration
//! handshake, heartbeats, fixed-delay reconnect, and inbound/outbound
//! schema validation.
//!
//! The connect/reconnect loop is a `tokio::select!`-driven read/write loop
//! over a single split WebSocket stream, with fixed-delay/max-attempts
//! reconnect policy and a registration handshake inserted before the main
//! loop starts.

use crate::sanitize::sanitize;
use crate::schema::{InboundFrame, OutboundFrame, SUPPORTED_PROTOCOL_VERSIONS};
use crate::session::SessionManager;
use futures_util::{SinkExt, StreamExt};
use node_agent_core::{AgentConfig, AuthFailureKind, Error, Result, Telemetry};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Events surfaced to the agent service so it can drive buffering, initial
/// sync, and telemetry (§4.E, §4.F).
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected { heartbeat_interval_ms: u64 },
    Disconnected,
    AuthExpired,
    AuthRevoked,
    AuthUnavailable,
    ProtocolUnsupported,
    ReconnectFailed,
}

fn expired_reason() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)expired").unwrap())
}

fn revoked_reason() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)revoked|invalid auth|invalid token").unwrap())
}

/// Classification of a close event per §4.E's code/reason table.
enum CloseClass {
    AuthExpired,
    AuthRevoked,
    Normal,
}

fn classify_close(code: Option<u16>, reason: &str) -> CloseClass {
    match code {
        Some(4001) | Some(4401) => CloseClass::AuthExpired,
        Some(4003) | Some(4403) => CloseClass::AuthRevoked,
        _ if expired_reason().is_match(reason) => CloseClass::AuthExpired,
        _ if revoked_reason().is_match(reason) => CloseClass::AuthRevoked,
        _ => CloseClass::Normal,
    }
}

pub struct CncClient {
    config: AgentConfig,
    telemetry: Arc<Telemetry>,
    sessions: SessionManager,
    should_reconnect: AtomicBool,
}

impl CncClient {
    pub fn new(config: AgentConfig, telemetry: Arc<Telemetry>) -> Self {
        let sessions = SessionManager::new(Arc::clone(&telemetry));
        Self {
            config,
            telemetry,
            sessions,
            should_reconnect: AtomicBool::new(true),
        }
    }

    /// Run the connect/register/heartbeat/dispatch loop forever, driven by
    /// `outbound_rx` and emitting parsed commands to `inbound_tx` and
    /// lifecycle notices to `events_tx`. Returns only once reconnect has
    /// been permanently disabled (protocol mismatch) or the attempt cap is
    /// exceeded.
    pub async fn run(
        &self,
        register_frame: impl Fn() -> OutboundFrame + Send + Sync,
        inbound_tx: mpsc::UnboundedSender<InboundFrame>,
        mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let mut attempts: u32 = 0;

        loop {
            if !self.should_reconnect.load(Ordering::SeqCst) {
                return;
            }

            let token = match self.sessions.resolve(&self.config).await {
                Ok(token) => token,
                Err(Error::Auth(AuthFailureKind::Expired, _)) => {
                    let _ = events_tx.send(TransportEvent::AuthExpired);
                    self.sleep_reconnect().await;
                    continue;
                }
                Err(Error::Auth(AuthFailureKind::Revoked, _)) => {
                    let _ = events_tx.send(TransportEvent::AuthRevoked);
                    self.sleep_reconnect().await;
                    continue;
                }
                Err(_) => {
                    let _ = events_tx.send(TransportEvent::AuthUnavailable);
                    self.sleep_reconnect().await;
                    continue;
                }
            };

            match self.connect_and_serve(&token, &register_frame, &inbound_tx, &mut outbound_rx, &events_tx).await {
                Ok(()) => {}
                Err(e) => {
                    debug!(error = %e, "connection attempt failed");
                }
            }

            let _ = events_tx.send(TransportEvent::Disconnected);

            if !self.should_reconnect.load(Ordering::SeqCst) {
                return;
            }

            attempts += 1;
            if self.config.max_reconnect_attempts != 0 && attempts >= self.config.max_reconnect_attempts {
                self.telemetry.record_reconnect_failed();
                let _ = events_tx.send(TransportEvent::ReconnectFailed);
                return;
            }
            self.telemetry.record_reconnect_scheduled();
            self.sleep_reconnect().await;
        }
    }

    async fn sleep_reconnect(&self) {
        tokio::time::sleep(self.config.reconnect_interval()).await;
    }

    fn build_url(&self, token: &str) -> String {
        let base = self.config.cnc_url.trim_end_matches('/');
        let mut url = format!("{base}/ws/node");
        if self.config.ws_allow_query_token_fallback {
            url = format!("{url}?token={}", urlencode(token));
        }
        url
    }

    async fn connect_and_serve(
        &self,
        token: &str,
        register_frame: &impl Fn() -> OutboundFrame,
        inbound_tx: &mpsc::UnboundedSender<InboundFrame>,
        outbound_rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
        events_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()> {
        let url = self.build_url(token);
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Transient(format!("invalid C&C url: {e}")))?;

        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Transient(e.to_string()))?,
        );
        headers.insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(&format!("bearer, {token}"))
                .map_err(|e| Error::Transient(e.to_string()))?,
        );

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Transient(format!("C&C connect failed: {e}")))?;
        info!(node_id = %self.config.node_id, "connected to C&C");

        let (mut write, mut read) = ws_stream.split();

        let register = register_frame();
        self.send_frame(&mut write, &register).await?;

        let heartbeat_interval_ms = self.await_registered(&mut write, &mut read, events_tx).await?;
        let _ = events_tx.send(TransportEvent::Connected { heartbeat_interval_ms });

        let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval_ms.max(1)));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let frame = OutboundFrame::Heartbeat {
                        node_id: self.config.node_id.clone(),
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    };
                    self.send_frame(&mut write, &frame).await?;
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(frame) => { self.send_frame(&mut write, &frame).await?; }
                        None => return Ok(()),
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch_inbound(&text, inbound_tx, events_tx);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                                .unwrap_or((None, String::new()));
                            self.handle_close(code, &reason, events_tx);
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(Error::Transient(format!("C&C read error: {e}"))),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn await_registered(
        &self,
        write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
        read: &mut (impl futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
        events_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<u64> {
        let deadline = tokio::time::sleep(Duration::from_secs(15));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(Error::Timeout("C&C did not send registered reply in time".into()));
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<InboundFrame>(&text) {
                                Ok(InboundFrame::Registered { data, .. }) => {
                                    if let Some(ref version) = data.protocol_version {
                                        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version.as_str()) {
                                            self.telemetry.record_protocol_unsupported();
                                            self.should_reconnect.store(false, Ordering::SeqCst);
                                            let _ = events_tx.send(TransportEvent::ProtocolUnsupported);
                                            let close = CloseFrame {
                                                code: CloseCode::from(4406),
                                                reason: "unsupported protocol version".into(),
                                            };
                                            let _ = write.send(Message::Close(Some(close))).await;
                                            return Err(Error::Protocol(format!(
                                                "unsupported protocol version: {version}"
                                            )));
                                        }
                                    } else {
                                        warn!("registered reply missing protocolVersion, accepting for compatibility");
                                    }
                                    return Ok(data.heartbeat_interval_ms);
                                }
                                Ok(_) => continue,
                                Err(_) => {
                                    self.telemetry.record_inbound_validation_failure();
                                    continue;
                                }
                            }
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(Error::Transient(format!("C&C read error: {e}"))),
                        None => return Err(Error::Transient("C&C closed before registering".into())),
                    }
                }
            }
        }
    }

    fn dispatch_inbound(
        &self,
        text: &str,
        inbound_tx: &mpsc::UnboundedSender<InboundFrame>,
        events_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        match serde_json::from_str::<InboundFrame>(text) {
            Ok(InboundFrame::Error { data }) => {
                self.telemetry.record_protocol_error();
                warn!(message = %data.message, "C&C reported an error");
            }
            Ok(frame) => {
                if inbound_tx.send(frame).is_err() {
                    debug!("inbound receiver dropped, discarding frame");
                }
            }
            Err(e) => {
                self.telemetry.record_inbound_validation_failure();
                let raw: serde_json::Value =
                    serde_json::from_str(text).unwrap_or(serde_json::Value::Null);
                warn!(
                    direction = "inbound",
                    error = %e,
                    sanitized_raw = %sanitize(&raw),
                    "inbound frame failed schema validation"
                );
            }
        }
        let _ = events_tx; // reserved for future inbound-triggered events
    }

    async fn send_frame(
        &self,
        write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
        frame: &OutboundFrame,
    ) -> Result<()> {
        if let Err(reason) = frame.validate() {
            self.telemetry.record_outbound_validation_failure();
            let value = serde_json::to_value(frame).unwrap_or(serde_json::Value::Null);
            warn!(
                direction = "outbound",
                reason,
                sanitized_raw = %sanitize(&value),
                "outbound frame failed schema validation, dropping"
            );
            return Ok(());
        }
        let text = serde_json::to_string(frame)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::Transient(format!("C&C write failed: {e}")))
    }

    fn handle_close(&self, code: Option<u16>, reason: &str, events_tx: &mpsc::UnboundedSender<TransportEvent>) {
        match classify_close(code, reason) {
            CloseClass::AuthExpired => {
                self.sessions.invalidate();
                self.telemetry.record_auth_expired();
                let _ = events_tx.send(TransportEvent::AuthExpired);
            }
            CloseClass::AuthRevoked => {
                self.sessions.invalidate();
                self.telemetry.record_auth_revoked();
                let _ = events_tx.send(TransportEvent::AuthRevoked);
            }
            CloseClass::Normal => {}
        }
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_close_matches_known_codes() {
        assert!(matches!(classify_close(Some(4001), ""), CloseClass::AuthExpired));
        assert!(matches!(classify_close(Some(4403), ""), CloseClass::AuthRevoked));
        assert!(matches!(classify_close(Some(1000), "normal"), CloseClass::Normal));
    }

    #[test]
    fn classify_close_matches_reason_text_case_insensitively() {
        assert!(matches!(
            classify_close(None, "Session EXPIRED"),
            CloseClass::AuthExpired
        ));
        assert!(matches!(
            classify_close(None, "invalid token supplied"),
            CloseClass::AuthRevoked
        ));
    }

    #[test]
    fn urlencode_percent_encodes_reserved_characters() {
        assert_eq!(urlencode("a b+c"), "a%20b%2Bc");
        assert_eq!(urlencode("abc-123_.~"), "abc-123_.~");
    }

    #[test]
    fn build_url_appends_ws_node_path() {
        let client = CncClient::new(
            AgentConfig {
                cnc_url: "wss://cnc.example.com/".to_string(),
                node_id: "n1".to_string(),
                location: "lab".to_string(),
                auth_token: "tok".to_string(),
                public_url: None,
                session_token_url: None,
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
            },
            Arc::new(Telemetry::new()),
        );
        assert_eq!(client.build_url("tok"), "wss://cnc.example.com/ws/node");
    }
}
