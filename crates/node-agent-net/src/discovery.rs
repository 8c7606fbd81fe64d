//! ARP table discovery and ICMP liveness checks (§4.B).
//!
//! Every OS interaction here shells out to a platform utility rather than
//! crafting raw packets — `arp -a`, the system `ping`, and the NetBIOS
//! fallback tools. That keeps the agent runnable unprivileged, which raw
//! ARP/ICMP sockets are not.

use node_agent_core::{format_mac, DiscoveredHost};
use regex::Regex;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

const ARP_TIMEOUT: Duration = Duration::from_secs(30);

fn unix_mac_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9A-Fa-f]{1,2}(:[0-9A-Fa-f]{1,2}){5})").unwrap())
}

fn windows_mac_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9A-Fa-f]{2}(-[0-9A-Fa-f]{2}){5})").unwrap())
}

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b").unwrap())
}

/// Best-effort broadcast ping to prime the ARP cache before reading it.
/// macOS/Linux only; failure is logged and otherwise ignored.
async fn prime_arp_cache() {
    if cfg!(target_os = "windows") {
        return;
    }
    let broadcast = if cfg!(target_os = "macos") {
        "255.255.255.255"
    } else {
        "-b 255.255.255.255"
    };
    let mut cmd = Command::new("ping");
    if cfg!(target_os = "macos") {
        cmd.args(["-c", "1", "-t", "1", broadcast]);
    } else {
        cmd.args(["-c", "1", "-W", "1", "-b", "255.255.255.255"]);
    }
    match timeout(Duration::from_secs(2), cmd.output()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!(error = %e, "broadcast ping priming failed"),
        Err(_) => debug!("broadcast ping priming timed out"),
    }
}

/// Run `arp -a` and return its raw stdout, or an error message.
async fn run_arp_command() -> Result<String, String> {
    let output = timeout(ARP_TIMEOUT, Command::new("arp").arg("-a").output())
        .await
        .map_err(|_| "arp -a timed out after 30s".to_string())?
        .map_err(|e| format!("failed to spawn arp: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "arp -a exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

struct RawArpEntry {
    ip: String,
    mac: String,
    arp_name: Option<String>,
}

/// Parse `arp -a` output. Windows lines look like
/// `  192.168.1.1           aa-bb-cc-dd-ee-ff     dynamic`; Unix lines look
/// like `hostname (192.168.1.1) at aa:bb:cc:d:e:f on en0 ifscope [ethernet]`.
fn parse_arp_output(raw: &str) -> Vec<RawArpEntry> {
    let mac_re = if cfg!(target_os = "windows") {
        windows_mac_regex()
    } else {
        unix_mac_regex()
    };

    let mut entries = Vec::new();
    for line in raw.lines() {
        let mac_match = match mac_re.find(line) {
            Some(m) => m.as_str(),
            None => continue,
        };
        let ip_match = match ipv4_regex().find(line) {
            Some(m) => m.as_str(),
            None => continue,
        };
        let mac = match format_mac(mac_match) {
            Ok(mac) => mac,
            Err(_) => continue,
        };

        let arp_name = if cfg!(target_os = "windows") {
            None
        } else {
            line.split_whitespace()
                .next()
                .filter(|tok| *tok != ip_match && !tok.starts_with('('))
                .map(|tok| tok.to_string())
        };

        entries.push(RawArpEntry {
            ip: ip_match.to_string(),
            mac,
            arp_name,
        });
    }
    entries
}

fn is_usable_arp_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    if lower.is_empty() || lower == "?" || lower == "unknown" {
        return false;
    }
    IpAddr::from_str(name).is_err()
}

async fn reverse_dns(ip: &str) -> Option<String> {
    let ip: IpAddr = ip.parse().ok()?;
    tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip).ok())
        .await
        .ok()
        .flatten()
}

async fn netbios_name(ip: &str) -> Option<String> {
    crate::netbios::lookup(ip).await
}

/// Resolve a device's hostname, in order: the ARP-provided name (if
/// usable), reverse DNS, NetBIOS, else `None`.
async fn resolve_hostname(ip: &str, arp_name: Option<&str>) -> Option<String> {
    if let Some(name) = arp_name {
        if is_usable_arp_name(name) {
            return Some(name.to_string());
        }
    }
    if let Some(name) = reverse_dns(ip).await {
        return Some(name);
    }
    netbios_name(ip).await
}

/// Prime the ARP cache, read it, and resolve a hostname for each entry
/// (§4.B). Returns an empty vector (not an error) when `arp -a` itself
/// succeeds but finds nothing.
pub async fn scan_arp() -> Result<Vec<DiscoveredHost>, String> {
    prime_arp_cache().await;
    let raw = run_arp_command().await?;
    let parsed = parse_arp_output(&raw);

    let mut hosts = Vec::with_capacity(parsed.len());
    for entry in parsed {
        let hostname = resolve_hostname(&entry.ip, entry.arp_name.as_deref()).await;
        hosts.push(DiscoveredHost {
            ip: entry.ip,
            mac: entry.mac,
            hostname,
        });
    }
    Ok(hosts)
}

/// One ICMP echo round via the OS `ping` utility; errors map to `false`
/// (§4.B).
pub async fn is_host_alive(ip: &str, timeout_ms: u64) -> bool {
    let timeout_secs = (timeout_ms / 1000).max(1);
    let mut cmd = Command::new("ping");
    if cfg!(target_os = "windows") {
        cmd.args(["-n", "1", "-w", &timeout_ms.to_string(), ip]);
    } else if cfg!(target_os = "macos") {
        cmd.args(["-c", "1", "-t", &timeout_secs.to_string(), ip]);
    } else {
        cmd.args(["-c", "1", "-W", &timeout_secs.to_string(), ip]);
    }

    match timeout(Duration::from_millis(timeout_ms + 500), cmd.output()).await {
        Ok(Ok(output)) => output.status.success(),
        Ok(Err(e)) => {
            warn!(ip, error = %e, "ping invocation failed");
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_macos_style_arp_line() {
        let raw = "? (192.168.1.10) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]\n\
                    phantom.lan (192.168.1.20) at a:b:c:d:e:f on en0 ifscope [ethernet]";
        let entries = parse_arp_output(raw);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ip, "192.168.1.10");
        assert_eq!(entries[0].mac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(entries[0].arp_name.as_deref(), Some("?"));
        assert_eq!(entries[1].mac, "0A:0B:0C:0D:0E:0F");
    }

    #[test]
    fn skips_incomplete_lines() {
        let raw = "192.168.1.30 (incomplete)";
        assert!(parse_arp_output(raw).is_empty());
    }

    #[test]
    fn arp_name_usability() {
        assert!(!is_usable_arp_name("?"));
        assert!(!is_usable_arp_name(""));
        assert!(!is_usable_arp_name("unknown"));
        assert!(!is_usable_arp_name("192.168.1.10"));
        assert!(is_usable_arp_name("phantom.lan"));
    }

    #[tokio::test]
    async fn unreachable_address_reports_not_alive() {
        assert!(!is_host_alive("203.0.113.1", 100).await);
    }
}
