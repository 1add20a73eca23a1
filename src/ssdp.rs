//! SSDP discovery engine: per-interface multicast presence, `M-SEARCH`
//! response, and periodic `NOTIFY ssdp:alive` / `ssdp:byebye` emission.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Mutex;
use std::time::Duration;

use network_interface::NetworkInterfaceConfig;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

const SSDP_PORT: u16 = 1900;
const SSDP_MCAST_IPV4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const SSDP_MCAST_IPV6_LINK_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);
const SSDP_MCAST_IPV6_SITE_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0xc);

const NTS_ALIVE: &str = "ssdp:alive";
const NTS_BYEBYE: &str = "ssdp:byebye";

const UPNP_ROOTDEVICE: &str = "upnp:rootdevice";
const UPNP_DEVICE_MEDIASERVER: &str = "urn:schemas-upnp-org:device:MediaServer:1";
const UPNP_SERVICE_CONTENT_DIRECTORY: &str = "urn:schemas-upnp-org:service:ContentDirectory:1";
const UPNP_SERVICE_CONNECTION_MANAGER: &str = "urn:schemas-upnp-org:service:ConnectionManager:1";

fn ipv6_is_link_local(ip: Ipv6Addr) -> bool {
    const LL: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0);
    const MASK: Ipv6Addr = Ipv6Addr::new(0xffff, 0xffff, 0xffff, 0xffff, 0, 0, 0, 0);
    ip.to_bits() & MASK.to_bits() == LL.to_bits() & MASK.to_bits()
}

/// The set of advertisement targets this device announces: `upnp:rootdevice`,
/// the device type, each service type, and `uuid:<udn>`, per `SPEC_FULL.md` 4.1.
fn advertisement_targets(udn: Uuid) -> Vec<String> {
    vec![
        UPNP_ROOTDEVICE.to_string(),
        UPNP_DEVICE_MEDIASERVER.to_string(),
        UPNP_SERVICE_CONTENT_DIRECTORY.to_string(),
        UPNP_SERVICE_CONNECTION_MANAGER.to_string(),
        format!("uuid:{udn}"),
    ]
}

/// A parsed `M-SEARCH * HTTP/1.1` datagram.
#[derive(Debug)]
pub struct MSearchRequest {
    pub man: String,
    pub st: String,
    pub mx: Option<u32>,
}

/// Parses an incoming SSDP datagram. Anything that is not a well-formed
/// `M-SEARCH` request returns `None` without error — malformed or
/// uninteresting traffic on the multicast group is routine.
pub fn parse_msearch(buf: &[u8]) -> Option<MSearchRequest> {
    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(buf).ok()?;
    if req.method? != "M-SEARCH" {
        return None;
    }

    let mut man = None;
    let mut st = None;
    let mut mx = None;
    for header in req.headers.iter() {
        match header.name.to_ascii_uppercase().as_str() {
            "MAN" => man = std::str::from_utf8(header.value).ok().map(str::to_string),
            "ST" => st = std::str::from_utf8(header.value).ok().map(str::to_string),
            "MX" => mx = std::str::from_utf8(header.value).ok().and_then(|v| v.parse().ok()),
            _ => {}
        }
    }

    Some(MSearchRequest {
        man: man?,
        st: st?,
        mx,
    })
}

/// Whether `target` (one of [`advertisement_targets`]) matches the
/// requested `ST` value. `ssdp:all` matches every target.
fn target_matches(target: &str, st: &str) -> bool {
    st == "ssdp:all" || st == target
}

pub struct SsdpOptions {
    pub udn: Uuid,
    pub http_port: u16,
    pub server_field: &'static str,
    pub notify_interval: Duration,
    pub shutdown: CancellationToken,
}

struct BoundSocket {
    sock2: socket2::Socket,
    tokio: tokio::net::UdpSocket,
}

fn bind_socket(addr: SocketAddr) -> anyhow::Result<BoundSocket> {
    let domain = if addr.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 };
    let sock = socket2::Socket::new(domain, socket2::Type::DGRAM, None)?;
    #[cfg(not(target_os = "windows"))]
    sock.set_reuse_port(true)?;
    sock.set_reuse_address(true)?;
    sock.bind(&addr.into())?;
    sock.set_nonblocking(true)?;
    let clone = sock.try_clone()?;
    let tokio_sock = tokio::net::UdpSocket::from_std(clone.into())?;
    Ok(BoundSocket { sock2: sock, tokio: tokio_sock })
}

fn bind_v4() -> Option<BoundSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SSDP_PORT);
    let socket = bind_socket(addr.into())
        .map_err(|e| warn!("error creating IPv4 SSDP socket: {e:#}"))
        .ok()?;

    let interfaces = network_interface::NetworkInterface::show().unwrap_or_default();
    for nic in interfaces {
        for addr in nic.addr {
            if let IpAddr::V4(ip) = addr.ip() {
                if ip.is_loopback() {
                    continue;
                }
                if let Err(e) = socket.tokio.join_multicast_v4(SSDP_MCAST_IPV4, ip) {
                    debug!(interface = %ip, "error joining IPv4 multicast group: {e:#}");
                }
            }
        }
    }
    Some(socket)
}

fn bind_v6() -> Option<BoundSocket> {
    let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, SSDP_PORT, 0, 0);
    let socket = bind_socket(addr.into())
        .map_err(|e| warn!("error creating IPv6 SSDP socket: {e:#}"))
        .ok()?;

    let interfaces = network_interface::NetworkInterface::show().unwrap_or_default();
    for nic in interfaces {
        let mut has_ll = false;
        let mut has_sl = false;
        for addr in &nic.addr {
            if let IpAddr::V6(ip) = addr.ip() {
                if ip.is_loopback() {
                    continue;
                }
                if ipv6_is_link_local(ip) {
                    has_ll = true;
                } else {
                    has_sl = true;
                }
            }
        }
        for (present, mcast) in [
            (has_ll, SSDP_MCAST_IPV6_LINK_LOCAL),
            (has_sl, SSDP_MCAST_IPV6_SITE_LOCAL),
        ] {
            if !present {
                continue;
            }
            if let Err(e) = socket.tokio.join_multicast_v6(&mcast, nic.index) {
                debug!(interface = nic.index, "error joining IPv6 multicast group: {e:#}");
            }
        }
    }
    Some(socket)
}

struct McastTarget {
    interface_addr: IpAddr,
    interface_index: u32,
    mcast_addr: SocketAddr,
}

impl McastTarget {
    fn addr_unscoped(&self) -> SocketAddr {
        let mut addr = self.mcast_addr;
        if let SocketAddr::V6(v6) = &mut addr {
            v6.set_scope_id(0);
        }
        addr
    }
}

fn live_mcast_targets() -> Vec<McastTarget> {
    let interfaces = match network_interface::NetworkInterface::show() {
        Ok(i) => i,
        Err(e) => {
            warn!("error enumerating network interfaces: {e:#}");
            return Vec::new();
        }
    };

    interfaces
        .into_iter()
        .flat_map(|nic| nic.addr.into_iter().map(move |a| (nic.index, a)))
        .filter_map(|(index, addr)| match addr.ip() {
            IpAddr::V4(a) if !a.is_loopback() => Some(McastTarget {
                interface_addr: IpAddr::V4(a),
                interface_index: index,
                mcast_addr: SocketAddr::V4(SocketAddrV4::new(SSDP_MCAST_IPV4, SSDP_PORT)),
            }),
            IpAddr::V6(a) if !a.is_loopback() => {
                let mcast = if ipv6_is_link_local(a) {
                    SSDP_MCAST_IPV6_LINK_LOCAL
                } else {
                    SSDP_MCAST_IPV6_SITE_LOCAL
                };
                Some(McastTarget {
                    interface_addr: IpAddr::V6(a),
                    interface_index: index,
                    mcast_addr: SocketAddr::V6(SocketAddrV6::new(mcast, SSDP_PORT, 0, index)),
                })
            }
            _ => None,
        })
        .collect()
}

/// Runs the SSDP engine until `opts.shutdown` fires, then emits
/// `ssdp:byebye` for every advertisement once, best-effort.
pub struct SsdpEngine {
    opts: SsdpOptions,
    socket_v4: Option<BoundSocket>,
    socket_v6: Option<BoundSocket>,
}

impl SsdpEngine {
    pub fn new(opts: SsdpOptions) -> Self {
        Self {
            socket_v4: bind_v4(),
            socket_v6: bind_v6(),
            opts,
        }
    }

    fn location_for(&self, host_ip: IpAddr) -> String {
        let host = match host_ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        format!("http://{host}:{}/rootDesc.xml", self.opts.http_port)
    }

    fn notify_message(&self, target: &McastTarget, nt: &str, nts: &str) -> String {
        let usn = if nt.starts_with("uuid:") {
            nt.to_string()
        } else {
            format!("uuid:{}::{}", self.opts.udn, nt)
        };
        let host = target.addr_unscoped();
        let location = self.location_for(target.interface_addr);
        format!(
            "NOTIFY * HTTP/1.1\r\nHOST: {host}\r\nCACHE-CONTROL: max-age=1800\r\nLOCATION: {location}\r\nNT: {nt}\r\nNTS: {nts}\r\nSERVER: {server}\r\nUSN: {usn}\r\n\r\n",
            server = self.opts.server_field,
        )
    }

    fn discover_response(&self, st: &str, local_ip: IpAddr) -> String {
        let usn = if st.starts_with("uuid:") {
            st.to_string()
        } else {
            format!("uuid:{}::{}", self.opts.udn, st)
        };
        let location = self.location_for(local_ip);
        format!(
            "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=1800\r\nEXT:\r\nLOCATION: {location}\r\nSERVER: {server}\r\nST: {st}\r\nUSN: {usn}\r\nCONTENT-LENGTH: 0\r\n\r\n",
            server = self.opts.server_field,
        )
    }

    async fn send_to_all_targets(&self, payload_for: impl Fn(&McastTarget) -> String) {
        let sent = Mutex::new(HashSet::new());
        let targets = live_mcast_targets();

        let futures = targets.iter().map(|target| {
            let payload = payload_for(target);
            async move {
                {
                    let mut sent = sent.lock().unwrap();
                    if !sent.insert((payload.clone(), target.interface_index, target.mcast_addr)) {
                        return;
                    }
                }

                let sock = match (target.interface_addr, self.socket_v4.as_ref(), self.socket_v6.as_ref()) {
                    (IpAddr::V4(ip), Some(s4), _) => {
                        let _ = s4.sock2.set_multicast_if_v4(&ip);
                        s4
                    }
                    (IpAddr::V6(_), _, Some(s6)) => {
                        let _ = s6.sock2.set_multicast_if_v6(target.interface_index);
                        s6
                    }
                    _ => return,
                };

                if let Err(e) = sock.tokio.send_to(payload.as_bytes(), target.mcast_addr).await {
                    trace!(addr = %target.mcast_addr, "error sending SSDP datagram: {e:#}");
                }
            }
        });

        futures_util::future::join_all(futures).await;
    }

    async fn announce(&self, nts: &str) {
        for nt in advertisement_targets(self.opts.udn) {
            self.send_to_all_targets(|target| self.notify_message(target, &nt, nts)).await;
        }
    }

    async fn periodic_notify_loop(&self) {
        loop {
            let smear = rand::rng().random_range(0..self.opts.notify_interval.as_millis().max(1) as u64 / 4 + 1);
            tokio::time::sleep(Duration::from_millis(smear)).await;
            self.announce(NTS_ALIVE).await;
            tokio::time::sleep(self.opts.notify_interval).await;
        }
    }

    async fn reply_to_msearch(&self, sock: &BoundSocket, peer: SocketAddr, req: MSearchRequest) {
        if req.man.trim_matches('"') != "ssdp:discover" {
            return;
        }
        let local_ip = match peer.ip() {
            IpAddr::V4(_) => live_mcast_targets()
                .into_iter()
                .find(|t| t.interface_addr.is_ipv4())
                .map(|t| t.interface_addr),
            IpAddr::V6(_) => live_mcast_targets()
                .into_iter()
                .find(|t| t.interface_addr.is_ipv6())
                .map(|t| t.interface_addr),
        };
        let Some(local_ip) = local_ip else {
            return;
        };

        let mx = req.mx.unwrap_or(1).min(5);
        let delay_ms = if mx == 0 { 0 } else { rand::rng().random_range(0..=(mx as u64 * 1000)) };
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        for target in advertisement_targets(self.opts.udn) {
            if target_matches(&target, &req.st) {
                let response = self.discover_response(&target, local_ip);
                if let Err(e) = sock.tokio.send_to(response.as_bytes(), peer).await {
                    trace!(addr = %peer, "error sending M-SEARCH reply: {e:#}");
                }
            }
        }
    }

    async fn listen_loop(&self, sock: Option<&BoundSocket>) {
        let Some(sock) = sock else { return };
        let mut buf = vec![0u8; 8192];
        loop {
            let (len, peer) = match sock.tokio.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("error receiving on SSDP socket: {e:#}");
                    return;
                }
            };
            if let Some(req) = parse_msearch(&buf[..len]) {
                self.reply_to_msearch(sock, peer, req).await;
            }
        }
    }

    pub async fn run(&self) {
        let listen_v4 = self.listen_loop(self.socket_v4.as_ref());
        let listen_v6 = self.listen_loop(self.socket_v6.as_ref());
        let notify = self.periodic_notify_loop();

        tokio::select! {
            _ = async { tokio::join!(listen_v4, listen_v6, notify) } => {}
            _ = self.opts.shutdown.cancelled() => {
                self.announce(NTS_BYEBYE).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_msearch_request() {
        let raw = b"M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nMAN: \"ssdp:discover\"\r\nST: ssdp:all\r\nMX: 3\r\n\r\n";
        let req = parse_msearch(raw).unwrap();
        assert_eq!(req.man, "\"ssdp:discover\"");
        assert_eq!(req.st, "ssdp:all");
        assert_eq!(req.mx, Some(3));
    }

    #[test]
    fn ignores_non_msearch_datagrams() {
        let raw = b"NOTIFY * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nNTS: ssdp:alive\r\n\r\n";
        assert!(parse_msearch(raw).is_none());
    }

    #[test]
    fn target_matches_ssdp_all() {
        assert!(target_matches(UPNP_ROOTDEVICE, "ssdp:all"));
        assert!(target_matches(UPNP_ROOTDEVICE, UPNP_ROOTDEVICE));
        assert!(!target_matches(UPNP_ROOTDEVICE, UPNP_DEVICE_MEDIASERVER));
    }

    #[test]
    fn advertisement_targets_include_udn() {
        let udn = Uuid::nil();
        let targets = advertisement_targets(udn);
        assert!(targets.contains(&format!("uuid:{udn}")));
        assert_eq!(targets.len(), 5);
    }
}
