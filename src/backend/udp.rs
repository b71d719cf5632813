use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::err::ProbeError;
use crate::packet::{ProbeKind, ProbePacket};
use crate::transport::{ErrQueueEvent, IpVersion, RawSocket, RecvEvent};

use super::ProbeConnection;

/// First destination port probed, the traceroute convention.
pub const BASE_PORT: u16 = 33434;

/// UDP probe connection.
///
/// Probes are plain datagrams sent to `base_port + seq`; nobody listens
/// there, so the interesting signal is the ICMP errors they provoke. A
/// port-unreachable means the destination host itself answered and is
/// reported as a reply, completing a traceroute.
#[derive(Debug)]
pub struct UdpConn {
    sock: RawSocket,
    version: IpVersion,
    base_port: AtomicU16,
    /// Platforms without a socket error queue watch a companion ICMP
    /// connection instead, matching on our bound source port.
    #[cfg(not(target_os = "linux"))]
    icmp: RawSocket,
}

impl UdpConn {
    pub fn open(version: IpVersion) -> Result<UdpConn, ProbeError> {
        let sock = RawSocket::open_udp(version, 0)?;
        #[cfg(not(target_os = "linux"))]
        let icmp = RawSocket::open_icmp(version)?;
        Ok(UdpConn {
            sock,
            version,
            base_port: AtomicU16::new(BASE_PORT),
            #[cfg(not(target_os = "linux"))]
            icmp,
        })
    }

    /// The bound local port identifying this connection in ICMP error
    /// bodies.
    pub fn local_port(&self) -> u16 {
        self.sock.ident()
    }

    fn dest_port(&self, seq: u16) -> u16 {
        self.base_port.load(Ordering::Relaxed).wrapping_add(seq)
    }

    fn seq_of_port(&self, port: u16) -> u16 {
        port.wrapping_sub(self.base_port.load(Ordering::Relaxed))
    }

    /// Maps an ICMP type/code pair of this connection's IP version onto
    /// a probe kind. Port-unreachable is the arrival signal.
    fn classify_type(&self, icmp_type: u8, icmp_code: u8) -> Option<ProbeKind> {
        use crate::packet::{icmp_v4, icmp_v6};
        match self.version {
            IpVersion::V4 => match icmp_type {
                icmp_v4::TYPE_TIME_EXCEEDED => Some(ProbeKind::TimeExceeded),
                icmp_v4::TYPE_DEST_UNREACH if icmp_code == icmp_v4::CODE_DST_UNREACH_PORT => {
                    Some(ProbeKind::EchoReply)
                }
                icmp_v4::TYPE_DEST_UNREACH => Some(ProbeKind::DestinationUnreachable),
                _ => None,
            },
            IpVersion::V6 => match icmp_type {
                icmp_v6::TYPE_TIME_EXCEEDED => Some(ProbeKind::TimeExceeded),
                icmp_v6::TYPE_DEST_UNREACH if icmp_code == icmp_v6::CODE_DST_UNREACH_PORT => {
                    Some(ProbeKind::EchoReply)
                }
                icmp_v6::TYPE_DEST_UNREACH => Some(ProbeKind::DestinationUnreachable),
                _ => None,
            },
        }
    }

    fn classify_err_event(&self, event: ErrQueueEvent) -> Option<(ProbePacket, IpAddr)> {
        let kind = self.classify_type(event.ee_type, event.ee_code)?;
        let port = event.orig_dest_port?;
        let seq = self.seq_of_port(port);
        let peer = event.offender?;
        Some((ProbePacket::reply(kind, seq), peer))
    }

    /// Matches an ICMP error frame from the companion connection
    /// against our source port and recovers the sequence from the
    /// embedded destination port.
    #[cfg(not(target_os = "linux"))]
    fn classify_companion_frame(&self, bytes: &[u8], peer: IpAddr) -> Option<(ProbePacket, IpAddr)> {
        use crate::packet::{icmp_v4, icmp_v6, EmbeddedProbe, IcmpMessage};

        let frame = if self.icmp.includes_ip_header() {
            icmp_v4::strip_ip_header(bytes).ok()?
        } else {
            bytes
        };
        let message = match self.version {
            IpVersion::V4 => icmp_v4::parse(frame).ok()?,
            IpVersion::V6 => icmp_v6::parse(frame).ok()?,
        };
        let (icmp_type, icmp_code, embedded) = match message {
            IcmpMessage::TimeExceeded(embedded) => match self.version {
                IpVersion::V4 => (icmp_v4::TYPE_TIME_EXCEEDED, 0, embedded),
                IpVersion::V6 => (icmp_v6::TYPE_TIME_EXCEEDED, 0, embedded),
            },
            IcmpMessage::DestinationUnreachable { code, embedded } => match self.version {
                IpVersion::V4 => (icmp_v4::TYPE_DEST_UNREACH, code, embedded),
                IpVersion::V6 => (icmp_v6::TYPE_DEST_UNREACH, code, embedded),
            },
            _ => return None,
        };
        match embedded {
            EmbeddedProbe::Udp {
                source_port,
                destination_port,
            } if source_port == self.local_port() => {
                let kind = self.classify_type(icmp_type, icmp_code)?;
                Some((
                    ProbePacket::reply(kind, self.seq_of_port(destination_port)),
                    peer,
                ))
            }
            _ => None,
        }
    }
}

impl ProbeConnection for UdpConn {
    async fn send(
        &self,
        packet: &ProbePacket,
        dest: IpAddr,
        ttl: Option<u8>,
    ) -> Result<(), ProbeError> {
        let dest = SocketAddr::new(dest, self.dest_port(packet.seq));
        self.sock.send_to(&packet.payload, dest, ttl).await
    }

    async fn recv(&self, timeout: Duration) -> Result<(ProbePacket, IpAddr), ProbeError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProbeError::Timeout);
            }
            #[cfg(target_os = "linux")]
            {
                match self.sock.recv_from(remaining).await? {
                    RecvEvent::Packet { peer, .. } => {
                        // a datagram actually came back; not part of the
                        // probe protocol
                        tracing::trace!(%peer, "ignoring unexpected datagram");
                    }
                    RecvEvent::Error(event) => {
                        if let Some(reply) = self.classify_err_event(event) {
                            return Ok(reply);
                        }
                    }
                }
            }
            #[cfg(not(target_os = "linux"))]
            {
                match self.icmp.recv_from(remaining).await? {
                    RecvEvent::Packet { bytes, peer } => {
                        if let Some(reply) = self.classify_companion_frame(&bytes, peer) {
                            return Ok(reply);
                        }
                    }
                    RecvEvent::Error(event) => {
                        if let Some(reply) = self.classify_err_event(event) {
                            return Ok(reply);
                        }
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<(), ProbeError> {
        self.sock.close();
        #[cfg(not(target_os = "linux"))]
        self.icmp.close();
        Ok(())
    }

    fn advance_base_port(&self, delta: u16) {
        self.base_port.fetch_add(delta, Ordering::Relaxed);
    }
}
