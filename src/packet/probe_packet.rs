use arrayvec::ArrayVec;

use super::ProbeKind;

/// Maximum payload a probe packet can carry.
///
/// The bound comes from the privsep packet encoding where the payload
/// length is a single byte; the codecs share it so a packet is always
/// representable on the pipe.
pub const MAX_PROBE_PAYLOAD: usize = 255;

/// A probe and its replies, independent of the wire protocol used.
///
/// The sequence number of a received packet always matches a previously
/// sent sequence (modulo 2^16). Payloads are not required to survive a
/// round trip: ICMP errors usually truncate the offending packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProbePacket {
    /// What this packet is.
    pub kind: ProbeKind,
    /// Sequence number tying replies to requests.
    pub seq: u16,
    /// Opaque payload (empty for most probes).
    pub payload: ArrayVec<u8, MAX_PROBE_PAYLOAD>,
}

impl ProbePacket {
    /// Builds an outbound echo request. Payloads longer than
    /// [`MAX_PROBE_PAYLOAD`] are truncated.
    pub fn request(seq: u16, payload: &[u8]) -> ProbePacket {
        let mut p = ArrayVec::new();
        let take = payload.len().min(MAX_PROBE_PAYLOAD);
        p.try_extend_from_slice(&payload[..take]).unwrap();
        ProbePacket {
            kind: ProbeKind::EchoRequest,
            seq,
            payload: p,
        }
    }

    /// Builds a payload-free reply of the given kind (used when
    /// reconstructing packets from ICMP error signals).
    pub fn reply(kind: ProbeKind, seq: u16) -> ProbePacket {
        ProbePacket {
            kind,
            seq,
            payload: ArrayVec::new(),
        }
    }

    /// Like [`ProbePacket::reply`] but carrying payload bytes, truncated
    /// to [`MAX_PROBE_PAYLOAD`].
    pub fn reply_with_payload(kind: ProbeKind, seq: u16, payload: &[u8]) -> ProbePacket {
        let mut packet = ProbePacket::request(seq, payload);
        packet.kind = kind;
        packet
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_truncates_payload() {
        let long = vec![0xabu8; 300];
        let packet = ProbePacket::request(7, &long);
        assert_eq!(ProbeKind::EchoRequest, packet.kind);
        assert_eq!(7, packet.seq);
        assert_eq!(MAX_PROBE_PAYLOAD, packet.payload.len());
        assert!(packet.payload.iter().all(|b| *b == 0xab));
    }

    #[test]
    fn reply_is_empty() {
        let packet = ProbePacket::reply(ProbeKind::TimeExceeded, 12);
        assert_eq!(ProbeKind::TimeExceeded, packet.kind);
        assert_eq!(12, packet.seq);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn reply_with_payload() {
        let packet = ProbePacket::reply_with_payload(ProbeKind::EchoReply, 3, b"hi");
        assert_eq!(ProbeKind::EchoReply, packet.kind);
        assert_eq!(b"hi", packet.payload.as_slice());
    }
}
