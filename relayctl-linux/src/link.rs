//! Emulated radio link over LAN UDP multicast.
//!
//! Each datagram is `dst(6) | src(6) | frame`. Every node in the group sees every
//! datagram; receivers keep only those addressed to them or to broadcast, like a
//! radio's address filter.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use relayctl_core::{LinkAddress, Transport, MAX_FRAME_LEN};
use tokio::net::UdpSocket;
use tracing::trace;

const ADDR_LEN: usize = 6;
pub const LINK_HEADER_LEN: usize = ADDR_LEN * 2;

/// Largest datagram a well-behaved node sends.
pub const MAX_DATAGRAM_LEN: usize = LINK_HEADER_LEN + MAX_FRAME_LEN;

pub async fn make_multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    tokio::net::UdpSocket::from_std(std_sock)
}

pub fn build_datagram(dst: &LinkAddress, src: &LinkAddress, frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LINK_HEADER_LEN + frame.len());
    out.extend_from_slice(dst.as_bytes());
    out.extend_from_slice(src.as_bytes());
    out.extend_from_slice(frame);
    out
}

/// Source address and frame of a datagram meant for `local`; `None` for anything else
/// (too short, other destination, our own transmission looped back).
pub fn accept_datagram<'a>(
    local: &LinkAddress,
    datagram: &'a [u8],
) -> Option<(LinkAddress, &'a [u8])> {
    if datagram.len() < LINK_HEADER_LEN {
        return None;
    }
    let mut dst = [0u8; ADDR_LEN];
    let mut src = [0u8; ADDR_LEN];
    dst.copy_from_slice(&datagram[..ADDR_LEN]);
    src.copy_from_slice(&datagram[ADDR_LEN..LINK_HEADER_LEN]);
    let (dst, src) = (LinkAddress(dst), LinkAddress(src));
    if src == *local || (dst != *local && !dst.is_broadcast()) {
        return None;
    }
    Some((src, &datagram[LINK_HEADER_LEN..]))
}

/// Send side handed to the protocol engine. Never blocks: a full socket buffer is a failed send.
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    local: LinkAddress,
}

impl UdpLink {
    pub fn new(socket: Arc<UdpSocket>, group: Ipv4Addr, port: u16, local: LinkAddress) -> Self {
        Self {
            socket,
            group: SocketAddr::V4(SocketAddrV4::new(group, port)),
            local,
        }
    }

    fn send(&self, dst: &LinkAddress, frame: &[u8]) -> bool {
        let datagram = build_datagram(dst, &self.local, frame);
        match self.socket.try_send_to(&datagram, self.group) {
            Ok(_) => true,
            Err(e) => {
                trace!(%dst, error = %e, "link send failed");
                false
            }
        }
    }
}

impl Transport for UdpLink {
    fn send_broadcast(&mut self, frame: &[u8]) -> bool {
        self.send(&LinkAddress::BROADCAST, frame)
    }

    fn send_unicast(&mut self, to: &LinkAddress, frame: &[u8]) -> bool {
        self.send(to, frame)
    }
}
