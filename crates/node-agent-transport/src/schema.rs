//! Inbound/outbound frame types and schema validation (§6).
//!
//! Inbound frames are JSON-parsed then matched against [`InboundFrame`];
//! serde's untagged-by-field-inspection dispatch does the schema check for
//! us — a frame that doesn't match any known `type` with the right `data`
//! shape fails to deserialize, which the caller treats as a validation
//! failure per §4.E.

use node_agent_core::{CommandResultPayload, HostPatch};
use serde::{Deserialize, Serialize};

/// One inbound command frame from the C&C peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundFrame {
    Registered {
        #[serde(rename = "commandId")]
        command_id: Option<String>,
        data: RegisteredData,
    },
    Wake {
        #[serde(rename = "commandId")]
        command_id: String,
        data: WakeData,
    },
    Scan {
        #[serde(rename = "commandId")]
        command_id: String,
        data: ScanData,
    },
    #[serde(rename = "update-host")]
    UpdateHost {
        #[serde(rename = "commandId")]
        command_id: String,
        data: UpdateHostData,
    },
    #[serde(rename = "delete-host")]
    DeleteHost {
        #[serde(rename = "commandId")]
        command_id: String,
        data: DeleteHostData,
    },
    #[serde(rename = "ping-host")]
    PingHost {
        #[serde(rename = "commandId")]
        command_id: String,
        data: PingHostData,
    },
    Ping {
        data: PingData,
    },
    Error {
        data: ErrorData,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredData {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "heartbeatInterval")]
    pub heartbeat_interval_ms: u64,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WakeData {
    #[serde(rename = "hostName")]
    pub host_name: String,
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanData {
    pub immediate: bool,
}

/// `{currentName?, name, mac?, ip?, status?, notes?, tags?}` (§6); maps
/// directly onto [`HostPatch`], whose own `current_name` field carries the
/// rename source.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateHostData {
    #[serde(flatten)]
    pub patch: HostPatch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteHostData {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingHostData {
    #[serde(rename = "hostName")]
    pub host_name: String,
    pub mac: Option<String>,
    pub ip: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingData {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub message: String,
}

/// Supported protocol versions; `Registered.data.protocol_version` is
/// checked against this set (§4.E).
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["1", "1.0"];

/// One outbound frame to the C&C peer. Every variant serialises with the
/// node id embedded, per §6.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundFrame {
    Register {
        #[serde(rename = "nodeId")]
        node_id: String,
        name: String,
        location: String,
        #[serde(rename = "publicUrl", skip_serializing_if = "Option::is_none")]
        public_url: Option<String>,
        metadata: RegisterMetadata,
    },
    Heartbeat {
        #[serde(rename = "nodeId")]
        node_id: String,
        timestamp: i64,
    },
    #[serde(rename = "host-discovered")]
    HostDiscovered {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(flatten)]
        host: HostFramePayload,
    },
    #[serde(rename = "host-updated")]
    HostUpdated {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(flatten)]
        host: HostFramePayload,
    },
    #[serde(rename = "host-removed")]
    HostRemoved {
        #[serde(rename = "nodeId")]
        node_id: String,
        name: String,
    },
    #[serde(rename = "scan-complete")]
    ScanComplete {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "hostCount")]
        host_count: usize,
    },
    #[serde(rename = "command-result")]
    CommandResult {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "commandId")]
        command_id: String,
        #[serde(flatten)]
        result: CommandResultPayload,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterMetadata {
    pub version: String,
    pub platform: String,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "networkInfo")]
    pub network_info: node_agent_net::NetworkInfo,
}

/// Outbound shape of a host record, serialised with field casing matching
/// the wire schema rather than [`node_agent_core::Host`]'s Rust-side names.
#[derive(Debug, Clone, Serialize)]
pub struct HostFramePayload {
    pub name: String,
    pub mac: String,
    pub ip: String,
    pub status: String,
    #[serde(rename = "lastSeen", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    pub discovered: bool,
    #[serde(rename = "pingResponsive", skip_serializing_if = "Option::is_none")]
    pub ping_responsive: Option<bool>,
}

impl OutboundFrame {
    /// Outbound schema check (§4.E "validated against the outbound schema"):
    /// beyond what the type system already enforces, reject a `host-*` frame
    /// whose name is empty, since this would be silently unroutable on the
    /// peer.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            OutboundFrame::HostDiscovered { host, .. } | OutboundFrame::HostUpdated { host, .. } => {
                if host.name.is_empty() {
                    return Err("host frame missing name".to_string());
                }
                Ok(())
            }
            OutboundFrame::HostRemoved { name, .. } => {
                if name.is_empty() {
                    Err("host-removed frame missing name".to_string())
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_wake_frame_parses() {
        let json = r#"{"type":"wake","commandId":"c1","data":{"hostName":"PHANTOM","mac":"AA:BB:CC:DD:EE:FF"}}"#;
        let frame: InboundFrame = serde_json::from_str(json).unwrap();
        match frame {
            InboundFrame::Wake { command_id, data } => {
                assert_eq!(command_id, "c1");
                assert_eq!(data.host_name, "PHANTOM");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn inbound_unknown_type_fails_to_parse() {
        let json = r#"{"type":"unknown-thing","data":{}}"#;
        let result: Result<InboundFrame, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn inbound_ping_requires_no_command_id() {
        let json = r#"{"type":"ping","data":{"timestamp":123}}"#;
        let frame: InboundFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(frame, InboundFrame::Ping { .. }));
    }

    #[test]
    fn outbound_host_removed_with_empty_name_fails_validation() {
        let frame = OutboundFrame::HostRemoved {
            node_id: "n1".to_string(),
            name: "".to_string(),
        };
        assert!(frame.validate().is_err());
    }

    #[test]
    fn outbound_heartbeat_always_valid() {
        let frame = OutboundFrame::Heartbeat {
            node_id: "n1".to_string(),
            timestamp: 0,
        };
        assert!(frame.validate().is_ok());
    }
}
