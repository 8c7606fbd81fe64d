//! Node Agent Core
//!
//! Shared types, error handling, environment-driven configuration, the
//! host lifecycle event bus, and runtime telemetry counters used by every
//! other crate in the workspace.
//!
//! # Examples
//!
//! ```
//! use node_agent_core::types::format_mac;
//!
//! assert_eq!(format_mac("aa:bb:cc:dd:ee:ff").unwrap(), "AA:BB:CC:DD:EE:FF");
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod telemetry;
pub mod types;

pub use config::{AgentConfig, Config, Mode, NetworkConfig, WakeVerificationConfig};
pub use error::{AuthFailureKind, Error, Result};
pub use lifecycle::{LifecycleBus, LifecycleEvent};
pub use telemetry::{Telemetry, TelemetrySnapshot};
pub use types::{
    format_mac, CommandExecutionRecord, CommandResultPayload, CommandState, CommandType,
    DiscoveredHost, Host, HostPatch, HostPingDetail, HostStatus, NewHost, SessionToken,
    WakeSource, WakeVerificationParams, WakeVerificationResult, WakeVerificationStatus,
};
