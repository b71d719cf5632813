use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::err::ProbeError;
use crate::packet::{icmp_v4, icmp_v6, EmbeddedProbe, IcmpMessage, ProbeKind, ProbePacket};
use crate::transport::{ErrQueueEvent, IpVersion, RawSocket, RecvEvent};

use super::ProbeConnection;

/// ICMP echo connection.
///
/// The kernel may deliver unrelated ICMP traffic to the same socket
/// (shared datagram sockets on macOS, raw sockets everywhere), so every
/// inbound frame is filtered on the connection's echo identifier before
/// it is surfaced.
#[derive(Debug)]
pub struct IcmpConn {
    sock: RawSocket,
    version: IpVersion,
}

impl IcmpConn {
    pub fn open(version: IpVersion) -> Result<IcmpConn, ProbeError> {
        let sock = RawSocket::open_icmp(version)?;
        Ok(IcmpConn { sock, version })
    }

    /// The echo identifier stamped on every request.
    pub fn ident(&self) -> u16 {
        self.sock.ident()
    }

    fn encode_request(&self, packet: &ProbePacket) -> Vec<u8> {
        match self.version {
            IpVersion::V4 => icmp_v4::echo_request(self.ident(), packet.seq, &packet.payload),
            // the kernel owns the pseudo-header, so it fills the checksum
            IpVersion::V6 => icmp_v6::echo_request(self.ident(), packet.seq, &packet.payload),
        }
    }

    /// Classifies one inbound frame. `None` means "not for us, keep
    /// reading".
    fn classify_frame(&self, bytes: &[u8], peer: IpAddr) -> Option<(ProbePacket, IpAddr)> {
        let frame = if self.sock.includes_ip_header() {
            match icmp_v4::strip_ip_header(bytes) {
                Ok(inner) => inner,
                Err(err) => {
                    debug!(%err, "skipping malformed frame");
                    return None;
                }
            }
        } else {
            bytes
        };
        let parsed = match self.version {
            IpVersion::V4 => icmp_v4::parse(frame),
            IpVersion::V6 => icmp_v6::parse(frame),
        };
        let message = match parsed {
            Ok(message) => message,
            Err(err) => {
                debug!(%err, "skipping malformed frame");
                return None;
            }
        };
        match message {
            // echo requests show up on the receive path on macOS IPv6
            // loopback; never ours
            IcmpMessage::EchoRequest(_) => None,
            IcmpMessage::EchoReply(echo) if echo.id == self.ident() => Some((
                ProbePacket::reply_with_payload(ProbeKind::EchoReply, echo.seq, echo.payload),
                peer,
            )),
            IcmpMessage::EchoReply(echo) => {
                trace!(id = echo.id, "discarding reply for foreign identifier");
                None
            }
            IcmpMessage::TimeExceeded(embedded) => self
                .match_embedded(embedded)
                .map(|seq| (ProbePacket::reply(ProbeKind::TimeExceeded, seq), peer)),
            IcmpMessage::DestinationUnreachable { embedded, .. } => self
                .match_embedded(embedded)
                .map(|seq| (ProbePacket::reply(ProbeKind::DestinationUnreachable, seq), peer)),
            IcmpMessage::Other => None,
        }
    }

    fn match_embedded(&self, embedded: EmbeddedProbe) -> Option<u16> {
        match embedded {
            EmbeddedProbe::IcmpEcho { id, seq } if id == self.ident() => Some(seq),
            _ => None,
        }
    }

    /// Classifies an error queue event: the returned data is the echo
    /// request exactly as this connection sent it.
    fn classify_err_event(&self, event: ErrQueueEvent) -> Option<(ProbePacket, IpAddr)> {
        let kind = match (self.version, event.ee_type) {
            (IpVersion::V4, icmp_v4::TYPE_TIME_EXCEEDED)
            | (IpVersion::V6, icmp_v6::TYPE_TIME_EXCEEDED) => ProbeKind::TimeExceeded,
            (IpVersion::V4, icmp_v4::TYPE_DEST_UNREACH)
            | (IpVersion::V6, icmp_v6::TYPE_DEST_UNREACH) => ProbeKind::DestinationUnreachable,
            _ => return None,
        };
        let parsed = match self.version {
            IpVersion::V4 => icmp_v4::parse(&event.data),
            IpVersion::V6 => icmp_v6::parse(&event.data),
        };
        let seq = match parsed {
            Ok(IcmpMessage::EchoRequest(echo)) => echo.seq,
            _ => return None,
        };
        let peer = event.offender?;
        Some((ProbePacket::reply(kind, seq), peer))
    }
}

impl ProbeConnection for IcmpConn {
    async fn send(
        &self,
        packet: &ProbePacket,
        dest: IpAddr,
        ttl: Option<u8>,
    ) -> Result<(), ProbeError> {
        let buf = self.encode_request(packet);
        self.sock
            .send_to(&buf, SocketAddr::new(dest, 0), ttl)
            .await
    }

    async fn recv(&self, timeout: Duration) -> Result<(ProbePacket, IpAddr), ProbeError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProbeError::Timeout);
            }
            match self.sock.recv_from(remaining).await? {
                RecvEvent::Packet { bytes, peer } => {
                    if let Some(reply) = self.classify_frame(&bytes, peer) {
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

    async fn close(&self) -> Result<(), ProbeError> {
        self.sock.close();
        Ok(())
    }
}
