//! Local network helpers for the LAN short-circuit
//!
//! Peers whose public address shares our /24 are probably behind the same
//! router, so they can reach each other on LAN addresses without punching.

use std::net::{IpAddr, Ipv4Addr, UdpSocket as StdUdpSocket};

/// Public targets used to find the default outbound interface.
/// Connecting a UDP socket sends nothing, it only consults the routing table.
const ROUTE_PROBES: &[&str] = &["8.8.8.8:80", "1.1.1.1:80"];

/// Address of the interface the default route goes through
pub fn local_lan_ip() -> IpAddr {
    if let Ok(socket) = StdUdpSocket::bind("0.0.0.0:0") {
        for target in ROUTE_PROBES {
            if socket.connect(target).is_ok() {
                if let Ok(local_addr) = socket.local_addr() {
                    let ip = local_addr.ip();
                    if !ip.is_unspecified() {
                        return ip;
                    }
                }
            }
        }
    }

    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Whether two dotted IPv4 strings share their first three octets
pub fn is_same_lan(a: &str, b: &str) -> bool {
    match (a.parse::<Ipv4Addr>(), b.parse::<Ipv4Addr>()) {
        (Ok(a), Ok(b)) => a.octets()[..3] == b.octets()[..3],
        _ => false,
    }
}
