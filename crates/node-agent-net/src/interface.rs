//! Network interface enumeration and the `networkInfo` derivation used by
//! the C&C registration handshake (§4.E).

use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

#[cfg(unix)]
use pnet_datalink as datalink;

#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("failed to enumerate network interfaces: {0}")]
    EnumerationFailed(String),
}

/// One network interface and the addresses bound to it.
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub mac_address: Option<Vec<u8>>,
    /// IPv4 address plus its network prefix length, e.g. `(192.168.1.5, 24)`.
    pub ipv4_addresses: Vec<(Ipv4Addr, u8)>,
    pub ipv6_addresses: Vec<Ipv6Addr>,
    pub is_up: bool,
    pub is_loopback: bool,
}

impl NetworkInterface {
    pub fn has_ipv4(&self) -> bool {
        !self.ipv4_addresses.is_empty()
    }

    pub fn first_ipv4(&self) -> Option<(Ipv4Addr, u8)> {
        self.ipv4_addresses.first().copied()
    }
}

/// Enumerate all interfaces known to the OS, including down and loopback
/// ones; callers filter as needed.
#[cfg(unix)]
pub fn enumerate_interfaces() -> Result<Vec<NetworkInterface>, InterfaceError> {
    let interfaces = datalink::interfaces();
    let mut result = Vec::with_capacity(interfaces.len());

    for iface in interfaces {
        let mut ipv4_addresses = Vec::new();
        let mut ipv6_addresses = Vec::new();

        for ip_network in iface.ips.iter() {
            match ip_network.ip() {
                IpAddr::V4(ipv4) => ipv4_addresses.push((ipv4, ip_network.prefix())),
                IpAddr::V6(ipv6) => {
                    let octets = ipv6.octets();
                    let is_link_local = octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80;
                    if !is_link_local {
                        ipv6_addresses.push(ipv6);
                    }
                }
            }
        }

        result.push(NetworkInterface {
            name: iface.name.clone(),
            mac_address: iface.mac.map(|mac| mac.octets().to_vec()),
            ipv4_addresses,
            ipv6_addresses,
            is_up: iface.is_up(),
            is_loopback: iface.is_loopback(),
        });
    }

    Ok(result)
}

#[cfg(not(unix))]
pub fn enumerate_interfaces() -> Result<Vec<NetworkInterface>, InterfaceError> {
    Err(InterfaceError::EnumerationFailed(
        "interface enumeration is not implemented on this platform".to_string(),
    ))
}

/// `{subnet, gateway}` sent in the `register` frame's `networkInfo` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub subnet: String,
    pub gateway: String,
}

impl Default for NetworkInfo {
    fn default() -> Self {
        Self {
            subnet: "0.0.0.0/0".to_string(),
            gateway: "0.0.0.0".to_string(),
        }
    }
}

/// Derive `networkInfo` from the first up, non-loopback interface carrying
/// an IPv4 address (§4.E): `subnet` is `address/prefix`; `gateway` is the
/// first three octets of that address followed by `.1`. Falls back to
/// `{0.0.0.0/0, 0.0.0.0}` when enumeration fails or no such interface
/// exists.
pub fn derive_network_info() -> NetworkInfo {
    let interfaces = match enumerate_interfaces() {
        Ok(ifaces) => ifaces,
        Err(_) => return NetworkInfo::default(),
    };

    let candidate = interfaces
        .into_iter()
        .filter(|iface| iface.is_up && !iface.is_loopback)
        .find_map(|iface| iface.first_ipv4());

    match candidate {
        Some((addr, prefix)) => {
            let octets = addr.octets();
            NetworkInfo {
                subnet: format!("{addr}/{prefix}"),
                gateway: format!("{}.{}.{}.1", octets[0], octets[1], octets[2]),
            }
        }
        None => NetworkInfo::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_network_info_is_unroutable_placeholder() {
        let info = NetworkInfo::default();
        assert_eq!(info.subnet, "0.0.0.0/0");
        assert_eq!(info.gateway, "0.0.0.0");
    }

    #[test]
    fn gateway_is_first_three_octets_plus_one() {
        let iface = NetworkInterface {
            name: "eth0".to_string(),
            mac_address: None,
            ipv4_addresses: vec![(Ipv4Addr::new(192, 168, 50, 73), 24)],
            ipv6_addresses: vec![],
            is_up: true,
            is_loopback: false,
        };
        let (addr, prefix) = iface.first_ipv4().unwrap();
        let octets = addr.octets();
        let gateway = format!("{}.{}.{}.1", octets[0], octets[1], octets[2]);
        assert_eq!(gateway, "192.168.50.1");
        assert_eq!(format!("{addr}/{prefix}"), "192.168.50.73/24");
    }

    #[test]
    #[cfg(unix)]
    fn enumerate_interfaces_finds_loopback() {
        let interfaces = enumerate_interfaces().unwrap();
        assert!(interfaces.iter().any(|iface| iface.is_loopback));
    }
}
