//! Multicast loop endpoint
//!
//! One endpoint owns a UDP socket joined to a single multicast group and a
//! separate unbound socket for sending, so the receive socket stays a pure
//! listener. Received RTP is delivered to the owner through an mpsc
//! channel; frames carrying the endpoint's own SSRC are suppressed so a
//! fabric never hears its own transmissions on the group.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::demux::{classify_datagram, PacketClass};
use crate::error::{Error, Result};
use crate::packet::peek_ssrc;
use crate::rtcp::is_rtcp_packet_type;
use crate::RtpSsrc;

/// Largest datagram the endpoint will accept.
const MAX_DATAGRAM: usize = 2048;

/// One datagram received on a loop, tagged with the loop name.
#[derive(Debug, Clone)]
pub struct LoopPacket {
    pub loop_name: String,
    pub data: Bytes,
    pub source: SocketAddr,
}

/// A multicast group endpoint.
pub struct MulticastEndpoint {
    name: String,
    group: SocketAddr,
    local_ssrc: RtpSsrc,
    send_socket: Arc<UdpSocket>,
    recv_task: JoinHandle<()>,
}

impl MulticastEndpoint {
    /// Join `group:port` and start delivering RTP/RTCP to `owner`.
    pub async fn bind(
        name: impl Into<String>,
        group: IpAddr,
        port: u16,
        owner: mpsc::Sender<LoopPacket>,
    ) -> Result<Self> {
        let name = name.into();
        if !group.is_multicast() {
            return Err(Error::JoinFailed(format!("{} is not a multicast group", group)));
        }

        let recv_socket = join_group(group, port)?;
        let send_socket = Arc::new(unbound_socket(group).await?);

        let local_ssrc: RtpSsrc = rand::random();
        let group_addr = SocketAddr::new(group, port);

        debug!(loop_name = %name, %group_addr, ssrc = local_ssrc, "joined multicast loop");

        let task_name = name.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, source) = match recv_socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(loop_name = %task_name, error = %e, "loop socket closed");
                        break;
                    }
                };

                let datagram = &buf[..len];
                if !should_deliver(datagram, local_ssrc) {
                    trace!(loop_name = %task_name, len, "dropped datagram");
                    continue;
                }

                let packet = LoopPacket {
                    loop_name: task_name.clone(),
                    data: Bytes::copy_from_slice(datagram),
                    source,
                };
                if owner.send(packet).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            name,
            group: group_addr,
            local_ssrc,
            send_socket,
            recv_task,
        })
    }

    /// Loop name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// SSRC this fabric uses when emitting on the loop; stable for the
    /// endpoint's lifetime.
    pub fn local_ssrc(&self) -> RtpSsrc {
        self.local_ssrc
    }

    /// Group address this endpoint is joined to.
    pub fn group(&self) -> SocketAddr {
        self.group
    }

    /// Best-effort send to the group. Returns the OS byte count, 0 when
    /// the send failed.
    pub async fn send(&self, buf: &[u8]) -> usize {
        match self.send_socket.send_to(buf, self.group).await {
            Ok(n) => n,
            Err(e) => {
                trace!(loop_name = %self.name, error = %e, "loop send failed");
                0
            }
        }
    }
}

impl Drop for MulticastEndpoint {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

/// Echo-suppressing delivery filter: RTCP passes through (the owner learns
/// peer SSRCs from it), RTP passes unless it carries `local_ssrc`, and
/// every other packet class is not loop traffic.
fn should_deliver(datagram: &[u8], local_ssrc: RtpSsrc) -> bool {
    if classify_datagram(datagram) != PacketClass::RtpRtcp {
        return false;
    }
    if datagram.len() >= 2 && is_rtcp_packet_type(datagram[1]) {
        return true;
    }
    peek_ssrc(datagram) != Some(local_ssrc)
}

/// Open a reuse-address socket bound to the group port and join the group.
fn join_group(group: IpAddr, port: u16) -> Result<UdpSocket> {
    let domain = match group {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr: SocketAddr = match group {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    };
    socket.bind(&bind_addr.into())?;

    match group {
        IpAddr::V4(v4) => socket
            .join_multicast_v4(&v4, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| Error::JoinFailed(format!("{}: {}", group, e)))?,
        IpAddr::V6(v6) => socket
            .join_multicast_v6(&v6, 0)
            .map_err(|e| Error::JoinFailed(format!("{}: {}", group, e)))?,
    }

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Open the unbound companion socket used for sending to the group.
async fn unbound_socket(group: IpAddr) -> Result<UdpSocket> {
    let bind_addr: SocketAddr = match group {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    Ok(UdpSocket::bind(bind_addr).await?)
}
