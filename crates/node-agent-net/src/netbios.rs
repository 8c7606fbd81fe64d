//! NetBIOS hostname fallback (§4.B), used when a device has neither a
//! usable ARP-table name nor a reverse-DNS record.

use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const NETBIOS_TIMEOUT: Duration = Duration::from_secs(3);

/// `nbtstat -A <ip>` on Windows, `nmblookup -A <ip>` on Linux/macOS. Returns
/// `None` on any failure, missing tool, or unparseable output — NetBIOS is
/// the last-resort hostname source, so its absence is never an error.
pub async fn lookup(ip: &str) -> Option<String> {
    let (program, args): (&str, Vec<&str>) = if cfg!(target_os = "windows") {
        ("nbtstat", vec!["-A", ip])
    } else {
        ("nmblookup", vec!["-A", ip])
    };

    let output = timeout(NETBIOS_TIMEOUT, Command::new(program).args(&args).output()).await;
    let output = match output {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(_)) => return None,
        Ok(Err(e)) => {
            debug!(ip, error = %e, "netbios lookup tool unavailable");
            return None;
        }
        Err(_) => {
            debug!(ip, "netbios lookup timed out");
            return None;
        }
    };

    let text = String::from_utf8_lossy(&output.stdout);
    parse_netbios_output(&text)
}

fn parse_netbios_output(text: &str) -> Option<String> {
    for line in text.lines() {
        let trimmed = line.trim();
        // nbtstat: "PHANTOM         <00>  UNIQUE      Registered"
        // nmblookup: "        PHANTOM<00>       <ACTIVE>"
        if let Some(idx) = trimmed.find('<') {
            let candidate = trimmed[..idx].trim();
            if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_graphic()) {
                return Some(candidate.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nbtstat_style_output() {
        let text = "\n        Host not found\n\nNetBIOS Remote Machine Name Table\n\n       Name               Type         Status\n    ---------------------------------------------\n    PHANTOM        <00>  UNIQUE      Registered\n";
        assert_eq!(parse_netbios_output(text).as_deref(), Some("PHANTOM"));
    }

    #[test]
    fn parses_nmblookup_style_output() {
        let text = "querying 192.168.1.10\n        PHANTOM<00>       <ACTIVE>\n        PHANTOM<20>       <ACTIVE>\n";
        assert_eq!(parse_netbios_output(text).as_deref(), Some("PHANTOM"));
    }

    #[test]
    fn returns_none_on_no_match() {
        assert!(parse_netbios_output("no useful output here").is_none());
    }
}
