//! Multicast socket setup shared by client and server (§6 external
//! interfaces). Grounded in `shred-ingest/src/receiver.rs`'s `Socket::new` +
//! `join_multicast_v4` sequence from the teacher, stripped of the
//! shred-specific hot-path tuning (`SO_BUSY_POLL`, `SO_TIMESTAMPNS`,
//! `recvmmsg` batching) that this protocol — one frame per datagram, no
//! sub-microsecond budget — has no use for. TTL and loopback configuration
//! are new: the teacher's feeds are receive-only, this one also transmits
//! to the group (§6: "Multicast TTL default 64; multicast loop disabled").

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};

/// Default multicast TTL (§6).
pub const DEFAULT_TTL: u32 = 64;

/// Binds a UDP socket to `group:port`, joins the multicast group on
/// `interface` (or `INADDR_ANY` if `None`), disables multicast loopback, and
/// sets the given TTL for outbound sends. Used identically by the client
/// (bind) and the server (startup) per §6: "Client joins the configured
/// group on bind; server joins the same group on startup."
pub fn bind_multicast(group: Ipv4Addr, port: u16, interface: Option<Ipv4Addr>, ttl: u32) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create UDP socket")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;

    let bind_addr = SocketAddrV4::new(group, port);
    socket.bind(&bind_addr.into()).with_context(|| format!("bind {bind_addr}"))?;

    let iface = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket
        .join_multicast_v4(&group, &iface)
        .with_context(|| format!("join multicast group {group} on {iface}"))?;

    socket.set_multicast_loop_v4(false).context("disable multicast loopback")?;
    socket.set_multicast_ttl_v4(ttl).context("set multicast TTL")?;

    Ok(socket)
}

/// Sends `buf` to the multicast group. A thin wrapper kept so callers don't
/// need to build a `SockAddr` by hand at every send site.
pub fn send_to(socket: &Socket, buf: &[u8], group: Ipv4Addr, port: u16) -> std::io::Result<usize> {
    let dest: SocketAddr = SocketAddrV4::new(group, port).into();
    socket.send_to(buf, &dest.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_multicast_joins_loopback_group() {
        // 239.255.0.0/16 is administratively-scoped (RFC 2365); safe for
        // tests to join on the loopback/default interface.
        let socket = bind_multicast(Ipv4Addr::new(239, 255, 7, 7), 0, None, DEFAULT_TTL);
        assert!(socket.is_ok(), "multicast bind/join should succeed: {socket:?}");
    }
}
