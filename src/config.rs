//! Server configuration.
//!
//! Command-line argument parsing and on-disk config-file loading are the
//! named out-of-scope collaborators (`SPEC_FULL.md` 1); this module exposes
//! the plain value type and small constructors they would call into, in the
//! spirit of the teacher's `ServerConfig`/`NetworkConfig` split, without
//! owning `clap` or a file format of its own.

use std::net::IpAddr;
use std::path::PathBuf;

use uuid::Uuid;

use crate::transcode::TranscodeMap;

/// A parsed CIDR prefix, used to evaluate `AllowedIpNets` for `/ctl`.
#[derive(Debug, Clone, Copy)]
pub struct IpNet {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNet {
    /// Parses `"10.0.0.0/8"` / `"fe80::/64"`. A bare address without a `/`
    /// suffix is treated as a host route (`/32` or `/128`).
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (addr_str, prefix_str) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_str.parse()?;
        let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix_str {
            Some(p) => p.parse::<u8>()?,
            None => max_prefix,
        };
        if prefix_len > max_prefix {
            anyhow::bail!("prefix length {prefix_len} exceeds {max_prefix} for {addr}");
        }
        Ok(Self { addr, prefix_len })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(candidate)) => {
                let mask = mask_for(self.prefix_len, 32);
                u32::from(net) & mask == u32::from(candidate) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(candidate)) => {
                let mask = mask_for(self.prefix_len, 128);
                u128::from(net) & mask == u128::from(candidate) & mask
            }
            _ => false,
        }
    }
}

fn mask_for(prefix_len: u8, bits: u32) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        let shift = bits - prefix_len as u32;
        (!0u128 << shift) & (if bits == 32 { 0xFFFF_FFFFu128 } else { u128::MAX })
    }
}

/// Strips an IPv6 zone suffix (`fe80::1%eth0` -> `fe80::1`) before matching
/// against `AllowedIpNets`, as required by `SPEC_FULL.md` 6/8.
pub fn strip_zone(ip_str: &str) -> &str {
    ip_str.split('%').next().unwrap_or(ip_str)
}

/// A device icon advertised in `rootDesc.xml` and served from
/// `/deviceIcon/<N>`.
#[derive(Debug, Clone)]
pub struct Icon {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mime_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Server-wide configuration, constructed once at startup and shared
/// read-only (`Arc<Config>`) across every request and SSDP loop.
#[derive(Clone)]
pub struct Config {
    pub root_object_path: PathBuf,
    pub friendly_name: String,
    pub udn: Uuid,
    pub http_port: u16,

    pub notify_interval: std::time::Duration,

    pub allowed_ip_nets: Vec<IpNet>,

    pub ignore_hidden: bool,
    pub ignore_unreadable: bool,
    pub ignore_paths: Vec<String>,

    pub no_transcode: bool,
    pub force_transcode_to: Option<&'static str>,
    pub transcodes: TranscodeMap,

    pub transcode_log_pattern: String,

    pub dynamic_streams_enabled: bool,

    pub icons: Vec<Icon>,

    pub stall_event_subscribe: bool,
}

impl Config {
    pub fn server_field(&self) -> &'static str {
        "Linux/3.4 DLNADOC/1.50 UPnP/1.0 dms/1"
    }

    /// Default transcode log directory, per the documented `HOME`
    /// environment variable (`SPEC_FULL.md` 6).
    pub fn default_transcode_log_pattern() -> String {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.dms/log/[tsname].log")
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if self.allowed_ip_nets.is_empty() {
            return true;
        }
        self.allowed_ip_nets.iter().any(|n| n.contains(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipnet_matches_prefix() {
        let net = IpNet::parse("10.0.0.0/8").unwrap();
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("192.0.2.5".parse().unwrap()));
    }

    #[test]
    fn ipnet_host_route_without_prefix() {
        let net = IpNet::parse("192.168.1.5").unwrap();
        assert!(net.contains("192.168.1.5".parse().unwrap()));
        assert!(!net.contains("192.168.1.6".parse().unwrap()));
    }

    #[test]
    fn ipv6_zone_is_stripped_before_matching() {
        let net = IpNet::parse("fe80::/64").unwrap();
        let ip: IpAddr = strip_zone("fe80::1%eth0").parse().unwrap();
        assert!(net.contains(ip));
    }
}
