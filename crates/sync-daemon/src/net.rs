//! Shared networking constants and address discovery.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;
use tracing::warn;

/// Bound on every socket read/connect. On expiry the connection is
/// dropped and logged; the reconciliation cadence is the retry.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on a single `accept` wait, so accept loops can re-check their
/// shutdown flag without blocking forever.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Discover the address this node is reachable at on its LAN.
///
/// Connecting a UDP socket to a public address selects the outbound
/// interface without sending any packets; the socket's local address is
/// then the one peers can reach. Falls back to loopback when the node
/// has no route.
pub fn local_ip() -> IpAddr {
    let resolved = UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    });

    match resolved {
        Ok(ip) => ip,
        Err(e) => {
            warn!("cannot determine local address ({}), assuming loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
