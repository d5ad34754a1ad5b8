//! UDP source socket setup.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Context;
use log::info;
use socket2::{Domain, Protocol, Socket, Type};

/// Creates a nonblocking UDP socket bound to `addr` for TS reception,
/// joining the multicast group when the address is one.
pub fn create_udp_socket(addr: SocketAddr) -> anyhow::Result<Socket> {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => anyhow::bail!("only IPv4 sources are supported"),
    };

    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("creating socket")?;
    socket.set_reuse_address(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("binding {addr}"))?;

    if ip.is_multicast() {
        // receive on the default interface
        socket
            .join_multicast_v4(&ip, &Ipv4Addr::UNSPECIFIED)
            .with_context(|| format!("joining multicast group {ip}"))?;
        info!("joined multicast group {ip}");
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}
