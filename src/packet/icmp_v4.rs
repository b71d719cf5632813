//! ICMPv4 echo construction and reply parsing (RFC 792).

use crate::checksum::Checksum;
use crate::err::ParseError;

use super::{Echo, EmbeddedProbe, IcmpMessage, UdpHeader};

/// ICMPv4 type value of an "Echo Reply" message.
pub const TYPE_ECHO_REPLY: u8 = 0;

/// ICMPv4 type value of a "Destination Unreachable" message.
pub const TYPE_DEST_UNREACH: u8 = 3;

/// ICMPv4 type value of an "Echo Request" message.
pub const TYPE_ECHO_REQUEST: u8 = 8;

/// ICMPv4 type value of a "Time Exceeded" message.
pub const TYPE_TIME_EXCEEDED: u8 = 11;

/// ICMPv4 destination unreachable code for "Port Unreachable".
///
/// In traceroute semantics this code means the destination host itself
/// answered; the UDP backend reports it as a reply, not an error.
pub const CODE_DST_UNREACH_PORT: u8 = 3;

/// IP protocol number of ICMP.
pub const IP_PROTO_ICMP: u8 = 1;

/// IP protocol number of UDP.
pub const IP_PROTO_UDP: u8 = 17;

/// Serialized size of the fixed part of an ICMPv4 echo message.
pub const HEADER_LEN: usize = 8;

/// Builds an ICMPv4 echo request with the standard Internet checksum
/// filled in.
pub fn echo_request(id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let id_be = id.to_be_bytes();
    let seq_be = seq.to_be_bytes();
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&[
        TYPE_ECHO_REQUEST,
        0,
        0,
        0,
        id_be[0],
        id_be[1],
        seq_be[0],
        seq_be[1],
    ]);
    buf.extend_from_slice(payload);
    let checksum = Checksum::new()
        .add_2bytes([TYPE_ECHO_REQUEST, 0])
        .add_2bytes(id_be)
        .add_2bytes(seq_be)
        .add_slice(payload)
        .ones_complement()
        .to_be_bytes();
    buf[2] = checksum[0];
    buf[3] = checksum[1];
    buf
}

/// Strips a leading IPv4 header off a received frame.
///
/// Raw v4 sockets deliver the IP header in front of the ICMP message;
/// datagram sockets do not (Linux never includes it, macOS is told not
/// to via `IP_STRIPHDR`). The transport knows which case applies.
pub fn strip_ip_header(buf: &[u8]) -> Result<&[u8], ParseError> {
    if buf.len() < 20 {
        return Err(ParseError::UnexpectedEndOfSlice {
            what: "IPv4 header",
            required_len: 20,
            len: buf.len(),
        });
    }
    let version = buf[0] >> 4;
    if version != 4 {
        return Err(ParseError::UnexpectedIpVersion { version });
    }
    let header_len = usize::from(buf[0] & 0xf) * 4;
    if header_len < 20 || buf.len() < header_len {
        return Err(ParseError::UnexpectedEndOfSlice {
            what: "IPv4 header options",
            required_len: header_len.max(20),
            len: buf.len(),
        });
    }
    Ok(&buf[header_len..])
}

/// Parses an ICMPv4 message (without a leading IP header).
///
/// Unrecognized types decode to [`IcmpMessage::Other`]; malformed frames
/// are a [`ParseError`]. Neither closes the socket.
pub fn parse(buf: &[u8]) -> Result<IcmpMessage<'_>, ParseError> {
    if buf.len() < HEADER_LEN {
        return Err(ParseError::UnexpectedEndOfSlice {
            what: "ICMPv4 header",
            required_len: HEADER_LEN,
            len: buf.len(),
        });
    }
    fn echo(buf: &[u8]) -> Echo<'_> {
        Echo {
            id: u16::from_be_bytes([buf[4], buf[5]]),
            seq: u16::from_be_bytes([buf[6], buf[7]]),
            payload: &buf[HEADER_LEN..],
        }
    }
    match buf[0] {
        TYPE_ECHO_REQUEST => Ok(IcmpMessage::EchoRequest(echo(buf))),
        TYPE_ECHO_REPLY => Ok(IcmpMessage::EchoReply(echo(buf))),
        TYPE_TIME_EXCEEDED => Ok(IcmpMessage::TimeExceeded(parse_embedded(
            &buf[HEADER_LEN..],
        )?)),
        TYPE_DEST_UNREACH => Ok(IcmpMessage::DestinationUnreachable {
            code: buf[1],
            embedded: parse_embedded(&buf[HEADER_LEN..])?,
        }),
        _ => Ok(IcmpMessage::Other),
    }
}

/// Extracts the probe identifiers from an ICMPv4 error body: an IPv4
/// header followed by at least the first eight bytes of the offending
/// packet.
fn parse_embedded(body: &[u8]) -> Result<EmbeddedProbe, ParseError> {
    if body.len() < 20 {
        return Err(ParseError::UnexpectedEndOfSlice {
            what: "embedded IPv4 header",
            required_len: 20,
            len: body.len(),
        });
    }
    let version = body[0] >> 4;
    if version != 4 {
        return Err(ParseError::UnexpectedIpVersion { version });
    }
    let header_len = usize::from(body[0] & 0xf) * 4;
    if header_len < 20 || body.len() < header_len + 8 {
        return Err(ParseError::UnexpectedEndOfSlice {
            what: "embedded probe",
            required_len: header_len.max(20) + 8,
            len: body.len(),
        });
    }
    let protocol = body[9];
    let inner = &body[header_len..];
    match protocol {
        IP_PROTO_ICMP => {
            if inner[0] != TYPE_ECHO_REQUEST {
                return Err(ParseError::UnexpectedEmbeddedIcmpType { type_u8: inner[0] });
            }
            Ok(EmbeddedProbe::IcmpEcho {
                id: u16::from_be_bytes([inner[4], inner[5]]),
                seq: u16::from_be_bytes([inner[6], inner[7]]),
            })
        }
        IP_PROTO_UDP => {
            let header = UdpHeader::from_bytes([
                inner[0], inner[1], inner[2], inner[3], inner[4], inner[5], inner[6], inner[7],
            ]);
            Ok(EmbeddedProbe::Udp {
                source_port: header.source_port,
                destination_port: header.destination_port,
            })
        }
        protocol => Err(ParseError::UnexpectedEmbeddedProtocol { protocol }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    /// Minimal IPv4 header (no options) for embedding in error bodies.
    fn ipv4_header(protocol: u8) -> [u8; 20] {
        let mut h = [0u8; 20];
        h[0] = 0x45;
        h[8] = 64; // ttl
        h[9] = protocol;
        h[12..16].copy_from_slice(&[10, 0, 0, 1]);
        h[16..20].copy_from_slice(&[192, 0, 2, 1]);
        h
    }

    fn time_exceeded_with_echo(id: u16, seq: u16) -> Vec<u8> {
        let mut buf = vec![TYPE_TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
        buf.extend_from_slice(&ipv4_header(IP_PROTO_ICMP));
        buf.extend_from_slice(&echo_request(id, seq, b"pingtop!")[..8]);
        buf
    }

    #[test]
    fn echo_request_layout() {
        let buf = echo_request(0x1234, 0x0102, b"hi");
        assert_eq!(TYPE_ECHO_REQUEST, buf[0]);
        assert_eq!(0, buf[1]);
        assert_eq!([0x12, 0x34], [buf[4], buf[5]]);
        assert_eq!([0x01, 0x02], [buf[6], buf[7]]);
        assert_eq!(b"hi", &buf[8..]);
        // checksum over the message with the checksum field zeroed
        // must equal the stored value
        let mut zeroed = buf.clone();
        zeroed[2] = 0;
        zeroed[3] = 0;
        let expected = Checksum::new().add_slice(&zeroed).ones_complement();
        assert_eq!(expected.to_be_bytes(), [buf[2], buf[3]]);
    }

    #[test]
    fn checksum_verifies_to_zero() {
        // Summing a message over its stored checksum yields the all-ones
        // word, whose complement is 0.
        let buf = echo_request(77, 12, &[1, 2, 3, 4, 5]);
        assert_eq!(0, Checksum::new().add_slice(&buf).ones_complement());
    }

    #[test]
    fn parse_echo_reply() {
        let mut buf = echo_request(9, 42, b"data");
        buf[0] = TYPE_ECHO_REPLY;
        match parse(&buf).unwrap() {
            IcmpMessage::EchoReply(echo) => {
                assert_eq!(9, echo.id);
                assert_eq!(42, echo.seq);
                assert_eq!(b"data", echo.payload);
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn parse_time_exceeded() {
        let buf = time_exceeded_with_echo(7, 3);
        match parse(&buf).unwrap() {
            IcmpMessage::TimeExceeded(EmbeddedProbe::IcmpEcho { id, seq }) => {
                assert_eq!(7, id);
                assert_eq!(3, seq);
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn parse_port_unreachable_with_embedded_udp() {
        let mut buf = vec![TYPE_DEST_UNREACH, CODE_DST_UNREACH_PORT, 0, 0, 0, 0, 0, 0];
        buf.extend_from_slice(&ipv4_header(IP_PROTO_UDP));
        let udp = UdpHeader {
            source_port: 40000,
            destination_port: 33437,
            length: 8,
            checksum: 0,
        };
        buf.extend_from_slice(&udp.to_bytes());
        match parse(&buf).unwrap() {
            IcmpMessage::DestinationUnreachable { code, embedded } => {
                assert_eq!(CODE_DST_UNREACH_PORT, code);
                assert_eq!(
                    EmbeddedProbe::Udp {
                        source_port: 40000,
                        destination_port: 33437
                    },
                    embedded
                );
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn parse_skips_unknown_types() {
        let buf = [13u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(IcmpMessage::Other, parse(&buf).unwrap());
    }

    #[test]
    fn parse_rejects_short_frames() {
        assert_eq!(
            ParseError::UnexpectedEndOfSlice {
                what: "ICMPv4 header",
                required_len: 8,
                len: 4
            },
            parse(&[8, 0, 0, 0]).unwrap_err()
        );
    }

    #[test]
    fn parse_rejects_embedded_tcp() {
        let mut buf = vec![TYPE_TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
        buf.extend_from_slice(&ipv4_header(6));
        buf.extend_from_slice(&[0u8; 8]);
        assert_eq!(
            ParseError::UnexpectedEmbeddedProtocol { protocol: 6 },
            parse(&buf).unwrap_err()
        );
    }

    #[test]
    fn strip_ip_header_basics() {
        let mut frame = ipv4_header(IP_PROTO_ICMP).to_vec();
        frame.extend_from_slice(&echo_request(1, 2, b""));
        let inner = strip_ip_header(&frame).unwrap();
        assert_eq!(TYPE_ECHO_REQUEST, inner[0]);

        assert_eq!(
            ParseError::UnexpectedIpVersion { version: 6 },
            strip_ip_header(&[0x60; 20]).unwrap_err()
        );
        assert!(strip_ip_header(&[0x45; 8]).is_err());
    }

    proptest! {
        #[test]
        fn echo_round_trip(
            id in any::<u16>(),
            seq in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64)
        ) {
            let buf = echo_request(id, seq, &payload);
            match parse(&buf).unwrap() {
                IcmpMessage::EchoRequest(echo) => {
                    prop_assert_eq!(id, echo.id);
                    prop_assert_eq!(seq, echo.seq);
                    prop_assert_eq!(payload.as_slice(), echo.payload);
                }
                other => prop_assert!(false, "unexpected parse result: {:?}", other),
            }
        }

        #[test]
        fn embedded_echo_round_trip(id in any::<u16>(), seq in any::<u16>()) {
            let buf = time_exceeded_with_echo(id, seq);
            match parse(&buf).unwrap() {
                IcmpMessage::TimeExceeded(EmbeddedProbe::IcmpEcho { id: got_id, seq: got_seq }) => {
                    prop_assert_eq!(id, got_id);
                    prop_assert_eq!(seq, got_seq);
                }
                other => prop_assert!(false, "unexpected parse result: {:?}", other),
            }
        }
    }
}
