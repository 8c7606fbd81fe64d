//! Wake-on-LAN magic packet construction and transmission.
//!
//! The packet is six `0xFF` bytes followed by the target MAC repeated
//! sixteen times (102 bytes total), broadcast over UDP to port 9.

use node_agent_core::{format_mac, Error, Result};
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::debug;

const WOL_PORT: u16 = 9;

fn build_magic_packet(mac: &str) -> Result<[u8; 102]> {
    let canonical = format_mac(mac)?;
    let octets: Vec<u8> = canonical
        .split(':')
        .map(|o| u8::from_str_radix(o, 16).unwrap())
        .collect();

    let mut packet = [0u8; 102];
    packet[..6].fill(0xFF);
    for block in 0..16 {
        let start = 6 + block * 6;
        packet[start..start + 6].copy_from_slice(&octets);
    }
    Ok(packet)
}

/// Send a magic packet to `mac` over the LAN broadcast address. Returns once
/// the UDP datagram has been handed to the kernel; WoL is fire-and-forget,
/// so this cannot confirm the target actually woke (§4.H handles that
/// separately).
pub async fn send_magic_packet(mac: &str) -> Result<()> {
    let packet = build_magic_packet(mac)?;

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(Error::Io)?;
    socket
        .set_broadcast(true)
        .map_err(Error::Io)?;

    let dest = SocketAddrV4::new(Ipv4Addr::BROADCAST, WOL_PORT);
    socket.send_to(&packet, dest).await.map_err(Error::Io)?;
    debug!(mac, "sent Wake-on-LAN magic packet");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_packet_has_expected_shape() {
        let packet = build_magic_packet("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(packet.len(), 102);
        assert_eq!(&packet[..6], &[0xFF; 6]);
        for block in 0..16 {
            let start = 6 + block * 6;
            assert_eq!(
                &packet[start..start + 6],
                &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
            );
        }
    }

    #[test]
    fn rejects_invalid_mac() {
        assert!(build_magic_packet("not-a-mac").is_err());
    }

    #[tokio::test]
    async fn send_succeeds_with_valid_mac() {
        assert!(send_magic_packet("AA:BB:CC:DD:EE:FF").await.is_ok());
    }
}
