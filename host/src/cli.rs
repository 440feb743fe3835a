use std::time::Duration;

use clap::Parser;

use crate::attach::AttachMode;

/// Longest interface name the kernel accepts, excluding the NUL.
const MAX_IFACE_LEN: usize = libc::IF_NAMESIZE - 1;

/// Drops inbound ICMP echo requests at XDP and reports every IPv4 packet.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Network interface to attach to (e.g. "eth0").
    #[arg(value_name = "IFACE", env = "PINGWALL_IFACE", value_parser = parse_iface)]
    pub iface: String,

    /// Attach in generic (SKB) mode instead of the driver's native XDP path.
    #[arg(long, visible_alias = "skb", env = "PINGWALL_FALLBACK")]
    pub fallback: bool,

    /// How long one poll of the event channel waits for records.
    #[arg(
        long,
        value_name = "MS",
        env = "PINGWALL_POLL_TIMEOUT_MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub poll_timeout_ms: u64,
}

impl Cli {
    pub fn mode(&self) -> AttachMode {
        if self.fallback {
            AttachMode::Fallback
        } else {
            AttachMode::FastPath
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

fn parse_iface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("interface name must not be empty".into());
    }
    if name.len() > MAX_IFACE_LEN {
        return Err(format!(
            "interface name is longer than {MAX_IFACE_LEN} bytes"
        ));
    }
    if name.contains(|c: char| c == '/' || c == '\0' || c.is_whitespace()) {
        return Err("interface name contains '/', NUL or whitespace".into());
    }
    Ok(name.to_owned())
}
