//! The framed protocol spoken between the unprivileged client and the
//! privileged server.
//!
//! Envelope layout:
//!
//! ```text
//! type (1 byte) | arg_count (1 byte) | { arg_len (1 byte) | arg_bytes }*
//! ```
//!
//! Every message is modeled as an explicit variant with hand-written
//! encode/decode; the privileged side of the pipe must be auditable, so
//! there is deliberately no reflection-based serialization here. Decoding
//! is strict: the server terminates on the first malformed message, the
//! client logs and skips it.

use std::io;
use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::backend::BackendKind;
use crate::err::{FrameError, ProbeError};
use crate::packet::{ProbeKind, ProbePacket};
use crate::transport::IpVersion;

/// Maximum bytes a single argument can occupy.
pub const MAX_ARG_LEN: usize = 255;

/// Maximum size of a whole envelope: type + count + 255 × (len + 255).
pub const MAX_ENVELOPE_LEN: usize = 2 + 255 * (1 + 255);

/// A packet argument spends 4 bytes on kind, sequence and length, so
/// its payload caps below [`crate::packet::MAX_PROBE_PAYLOAD`].
pub const MAX_ARG_PAYLOAD: usize = MAX_ARG_LEN - 4;

const TYPE_SHUTDOWN: u8 = 0;
const TYPE_PRIVILEGE_DROP: u8 = 1;
const TYPE_LOG: u8 = 2;
const TYPE_OPEN_CONNECTION: u8 = 3;
const TYPE_OPEN_CONNECTION_REPLY: u8 = 4;
const TYPE_CLOSE_CONNECTION: u8 = 5;
const TYPE_CLOSE_CONNECTION_REPLY: u8 = 6;
const TYPE_SEND_PING: u8 = 7;
const TYPE_PING_REPLY: u8 = 8;

/// One privsep protocol message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// Server exits normally.
    Shutdown,
    /// Server drops to the real uid, permanently.
    PrivilegeDrop,
    /// Log line forwarded from the server to the client's logger.
    Log(String),
    /// Open a transport of the given version and backend.
    OpenConnection {
        version: IpVersion,
        backend: BackendKind,
    },
    /// Answer to [`Message::OpenConnection`] with the assigned id.
    OpenConnectionReply { conn_id: u32 },
    /// Close the transport behind the id.
    CloseConnection { conn_id: u32 },
    /// Acknowledges the close; the id is invalid afterwards.
    CloseConnectionReply { conn_id: u32 },
    /// Send one probe on the connection. `ttl` 0 means no override.
    SendPing {
        conn_id: u32,
        packet: ProbePacket,
        dest: IpAddr,
        ttl: u32,
    },
    /// A reply received on the connection.
    PingReply {
        conn_id: u32,
        packet: ProbePacket,
        peer: IpAddr,
    },
}

/// Encodes a probe packet as `kind(1) | seq(2 BE) | payload_len(1) |
/// payload`. Payloads beyond 255 bytes cannot occur (the packet type is
/// bounded); the function exists standalone because the encoding is
/// also the privsep packet argument.
pub fn encode_packet(packet: &ProbePacket) -> Vec<u8> {
    let seq = packet.seq.to_be_bytes();
    let mut buf = Vec::with_capacity(4 + packet.payload.len());
    buf.push(packet.kind.kind_u8());
    buf.extend_from_slice(&seq);
    buf.push(packet.payload.len() as u8);
    buf.extend_from_slice(&packet.payload);
    buf
}

/// Strict inverse of [`encode_packet`]: the length byte must match the
/// remaining bytes exactly.
pub fn decode_packet(buf: &[u8]) -> Result<ProbePacket, FrameError> {
    if buf.len() < 4 {
        return Err(FrameError::InvalidPacketEncoding { len: buf.len() });
    }
    let kind = ProbeKind::from_u8(buf[0]).ok_or(FrameError::UnknownProbeKind(buf[0]))?;
    let seq = u16::from_be_bytes([buf[1], buf[2]]);
    let payload_len = usize::from(buf[3]);
    if buf.len() != 4 + payload_len {
        return Err(FrameError::InvalidPacketEncoding { len: buf.len() });
    }
    let mut packet = ProbePacket::request(seq, &buf[4..]);
    packet.kind = kind;
    Ok(packet)
}

fn encode_addr(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn decode_addr(arg: &[u8]) -> Result<IpAddr, FrameError> {
    match arg.len() {
        4 => {
            let octets: [u8; 4] = arg.try_into().unwrap();
            Ok(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = arg.try_into().unwrap();
            Ok(IpAddr::from(octets))
        }
        len => Err(FrameError::InvalidAddressLen(len)),
    }
}

fn decode_u32(arg: &[u8], what: &'static str) -> Result<u32, FrameError> {
    let bytes: [u8; 4] = arg
        .try_into()
        .map_err(|_| FrameError::UnexpectedArgLen {
            what,
            len: arg.len(),
        })?;
    Ok(u32::from_be_bytes(bytes))
}

fn decode_byte(arg: &[u8], what: &'static str) -> Result<u8, FrameError> {
    match arg {
        [value] => Ok(*value),
        _ => Err(FrameError::UnexpectedArgLen {
            what,
            len: arg.len(),
        }),
    }
}

impl Message {
    fn type_u8(&self) -> u8 {
        use Message::*;
        match self {
            Shutdown => TYPE_SHUTDOWN,
            PrivilegeDrop => TYPE_PRIVILEGE_DROP,
            Log(_) => TYPE_LOG,
            OpenConnection { .. } => TYPE_OPEN_CONNECTION,
            OpenConnectionReply { .. } => TYPE_OPEN_CONNECTION_REPLY,
            CloseConnection { .. } => TYPE_CLOSE_CONNECTION,
            CloseConnectionReply { .. } => TYPE_CLOSE_CONNECTION_REPLY,
            SendPing { .. } => TYPE_SEND_PING,
            PingReply { .. } => TYPE_PING_REPLY,
        }
    }

    fn args(&self) -> Vec<Vec<u8>> {
        use Message::*;
        match self {
            Shutdown | PrivilegeDrop => Vec::new(),
            Log(text) => {
                // over-long log lines are truncated to fit one argument
                let mut bytes = text.as_bytes();
                if bytes.len() > MAX_ARG_LEN {
                    bytes = &bytes[..MAX_ARG_LEN];
                }
                vec![bytes.to_vec()]
            }
            OpenConnection { version, backend } => {
                vec![vec![version.version_u8()], vec![backend.backend_u8()]]
            }
            OpenConnectionReply { conn_id }
            | CloseConnection { conn_id }
            | CloseConnectionReply { conn_id } => vec![conn_id.to_be_bytes().to_vec()],
            SendPing {
                conn_id,
                packet,
                dest,
                ttl,
            } => vec![
                conn_id.to_be_bytes().to_vec(),
                packet_arg(packet),
                encode_addr(*dest),
                ttl.to_be_bytes().to_vec(),
            ],
            PingReply {
                conn_id,
                packet,
                peer,
            } => vec![
                conn_id.to_be_bytes().to_vec(),
                packet_arg(packet),
                encode_addr(*peer),
            ],
        }
    }

    /// Serializes the message into one envelope.
    pub fn encode(&self) -> Vec<u8> {
        let args = self.args();
        debug_assert!(args.len() <= u8::MAX as usize);
        let mut buf = Vec::with_capacity(2 + args.iter().map(|a| 1 + a.len()).sum::<usize>());
        buf.push(self.type_u8());
        buf.push(args.len() as u8);
        for arg in &args {
            debug_assert!(arg.len() <= MAX_ARG_LEN);
            buf.push(arg.len() as u8);
            buf.extend_from_slice(arg);
        }
        buf
    }

    /// Decodes exactly one message from the start of `buf`, returning
    /// it together with the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Message, usize), FrameError> {
        if buf.len() < 2 {
            return Err(FrameError::UnexpectedEof);
        }
        let type_u8 = buf[0];
        let arg_count = buf[1];
        let mut args: Vec<&[u8]> = Vec::with_capacity(usize::from(arg_count));
        let mut offset = 2usize;
        for _ in 0..arg_count {
            let len = usize::from(*buf.get(offset).ok_or(FrameError::UnexpectedEof)?);
            offset += 1;
            let arg = buf
                .get(offset..offset + len)
                .ok_or(FrameError::UnexpectedEof)?;
            args.push(arg);
            offset += len;
        }
        Ok((Message::from_args(type_u8, &args)?, offset))
    }

    fn from_args(type_u8: u8, args: &[&[u8]]) -> Result<Message, FrameError> {
        let expect_args = |expected: u8| -> Result<(), FrameError> {
            if args.len() == usize::from(expected) {
                Ok(())
            } else {
                Err(FrameError::UnexpectedArgCount {
                    message_type: type_u8,
                    expected,
                    actual: args.len() as u8,
                })
            }
        };
        match type_u8 {
            TYPE_SHUTDOWN => {
                expect_args(0)?;
                Ok(Message::Shutdown)
            }
            TYPE_PRIVILEGE_DROP => {
                expect_args(0)?;
                Ok(Message::PrivilegeDrop)
            }
            TYPE_LOG => {
                expect_args(1)?;
                Ok(Message::Log(String::from_utf8_lossy(args[0]).into_owned()))
            }
            TYPE_OPEN_CONNECTION => {
                expect_args(2)?;
                let version_u8 = decode_byte(args[0], "ip version")?;
                let version = IpVersion::from_u8(version_u8).ok_or(FrameError::InvalidArgValue {
                    what: "ip version",
                    value: version_u8,
                })?;
                let backend_u8 = decode_byte(args[1], "backend id")?;
                let backend =
                    BackendKind::from_u8(backend_u8).ok_or(FrameError::InvalidArgValue {
                        what: "backend id",
                        value: backend_u8,
                    })?;
                Ok(Message::OpenConnection { version, backend })
            }
            TYPE_OPEN_CONNECTION_REPLY => {
                expect_args(1)?;
                Ok(Message::OpenConnectionReply {
                    conn_id: decode_u32(args[0], "connection id")?,
                })
            }
            TYPE_CLOSE_CONNECTION => {
                expect_args(1)?;
                Ok(Message::CloseConnection {
                    conn_id: decode_u32(args[0], "connection id")?,
                })
            }
            TYPE_CLOSE_CONNECTION_REPLY => {
                expect_args(1)?;
                Ok(Message::CloseConnectionReply {
                    conn_id: decode_u32(args[0], "connection id")?,
                })
            }
            TYPE_SEND_PING => {
                expect_args(4)?;
                Ok(Message::SendPing {
                    conn_id: decode_u32(args[0], "connection id")?,
                    packet: decode_packet(args[1])?,
                    dest: decode_addr(args[2])?,
                    ttl: decode_u32(args[3], "ttl")?,
                })
            }
            TYPE_PING_REPLY => {
                expect_args(3)?;
                Ok(Message::PingReply {
                    conn_id: decode_u32(args[0], "connection id")?,
                    packet: decode_packet(args[1])?,
                    peer: decode_addr(args[2])?,
                })
            }
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    /// Reads one message off the stream. `Ok(None)` marks a clean end
    /// of stream (EOF on a message boundary).
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Message>, ProbeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 1];
        match reader.read_exact(&mut head).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let type_u8 = head[0];
        let arg_count = read_byte(reader).await?;
        let mut storage: Vec<Vec<u8>> = Vec::with_capacity(usize::from(arg_count));
        for _ in 0..arg_count {
            let len = usize::from(read_byte(reader).await?);
            let mut arg = vec![0u8; len];
            reader
                .read_exact(&mut arg)
                .await
                .map_err(map_body_eof)?;
            storage.push(arg);
        }
        let args: Vec<&[u8]> = storage.iter().map(|a| a.as_slice()).collect();
        Ok(Some(Message::from_args(type_u8, &args)?))
    }

    /// Writes the message and flushes the stream.
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }
}

/// Packet argument: the packet encoding squeezed into one argument
/// slot, payload truncated so the slot's length byte still fits.
fn packet_arg(packet: &ProbePacket) -> Vec<u8> {
    let mut truncated;
    let packet = if packet.payload.len() > MAX_ARG_PAYLOAD {
        truncated = packet.clone();
        truncated.payload.truncate(MAX_ARG_PAYLOAD);
        &truncated
    } else {
        packet
    };
    encode_packet(packet)
}

async fn read_byte<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8, ProbeError> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).await.map_err(map_body_eof)?;
    Ok(byte[0])
}

/// EOF inside a message body is a framing violation, not a clean end.
fn map_body_eof(err: io::Error) -> ProbeError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProbeError::Frame(FrameError::UnexpectedEof)
    } else {
        ProbeError::Io(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Shutdown,
            Message::PrivilegeDrop,
            Message::Log("raw socket fallback".into()),
            Message::OpenConnection {
                version: IpVersion::V4,
                backend: BackendKind::Icmp,
            },
            Message::OpenConnection {
                version: IpVersion::V6,
                backend: BackendKind::Udp,
            },
            Message::OpenConnectionReply { conn_id: 1 },
            Message::CloseConnection { conn_id: 7 },
            Message::CloseConnectionReply { conn_id: 7 },
            Message::SendPing {
                conn_id: 3,
                packet: ProbePacket::request(260, b"abc"),
                dest: "192.0.2.55".parse().unwrap(),
                ttl: 12,
            },
            Message::PingReply {
                conn_id: 1234,
                packet: ProbePacket::reply_with_payload(ProbeKind::EchoReply, 2, b"payload"),
                peer: "10.0.8.2".parse().unwrap(),
            },
            Message::PingReply {
                conn_id: 9,
                packet: ProbePacket::reply(ProbeKind::TimeExceeded, 900),
                peer: "2001:db8::7".parse().unwrap(),
            },
        ]
    }

    #[test]
    fn decode_encode_identity() {
        for message in sample_messages() {
            let bytes = message.encode();
            let (decoded, consumed) = Message::decode(&bytes).unwrap();
            assert_eq!(message, decoded);
            assert_eq!(bytes.len(), consumed);
            // re-encoding a decoded message yields the original bytes
            assert_eq!(bytes, decoded.encode());
        }
    }

    #[test]
    fn ping_reply_round_trip() {
        // conn 1234, reply seq 2, payload "payload", peer 10.0.8.2
        let message = Message::PingReply {
            conn_id: 1234,
            packet: ProbePacket::reply_with_payload(ProbeKind::EchoReply, 2, b"payload"),
            peer: "10.0.8.2".parse().unwrap(),
        };
        let bytes = message.encode();
        let (decoded, _) = Message::decode(&bytes).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_eq!(
            FrameError::UnknownMessageType(99),
            Message::decode(&[99, 0]).unwrap_err()
        );
    }

    #[test]
    fn wrong_arg_count_is_rejected() {
        // a Shutdown with one argument
        assert_eq!(
            FrameError::UnexpectedArgCount {
                message_type: TYPE_SHUTDOWN,
                expected: 0,
                actual: 1
            },
            Message::decode(&[TYPE_SHUTDOWN, 1, 0]).unwrap_err()
        );
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let bytes = Message::OpenConnectionReply { conn_id: 5 }.encode();
        for cut in 0..bytes.len() {
            assert!(Message::decode(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn bad_address_len_is_rejected() {
        // PingReply with a 5 byte address argument
        let mut bytes = vec![TYPE_PING_REPLY, 3];
        bytes.extend_from_slice(&[4, 0, 0, 0, 1]); // conn id
        bytes.extend_from_slice(&[4, 1, 0, 1, 0]); // packet: EchoReply seq 1 len 0
        bytes.extend_from_slice(&[5, 1, 2, 3, 4, 5]); // 5-byte address
        assert_eq!(
            FrameError::InvalidAddressLen(5),
            Message::decode(&bytes).unwrap_err()
        );
    }

    #[test]
    fn packet_codec_rejects_inconsistent_lengths() {
        // length byte claims 3, only 2 present
        assert!(decode_packet(&[1, 0, 1, 3, 0xaa, 0xbb]).is_err());
        // trailing garbage
        assert!(decode_packet(&[1, 0, 1, 1, 0xaa, 0xbb]).is_err());
        // unknown kind
        assert_eq!(
            FrameError::UnknownProbeKind(7),
            decode_packet(&[7, 0, 1, 0]).unwrap_err()
        );
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        for message in sample_messages() {
            message.write_to(&mut client).await.unwrap();
        }
        drop(client);
        for expected in sample_messages() {
            let got = Message::read_from(&mut server).await.unwrap().unwrap();
            assert_eq!(expected, got);
        }
        assert!(Message::read_from(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_message_is_a_frame_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bytes = Message::OpenConnectionReply { conn_id: 3 }.encode();
        client.write_all(&bytes[..3]).await.unwrap();
        drop(client);
        match Message::read_from(&mut server).await {
            Err(ProbeError::Frame(FrameError::UnexpectedEof)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn packet_encoding_round_trip(
            kind in 0u8..4,
            seq in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=255)
        ) {
            let mut packet = ProbePacket::request(seq, &payload);
            packet.kind = ProbeKind::from_u8(kind).unwrap();
            let encoded = encode_packet(&packet);
            prop_assert_eq!(packet, decode_packet(&encoded).unwrap());
        }

        #[test]
        fn send_ping_round_trip(
            conn_id in any::<u32>(),
            seq in any::<u16>(),
            ttl in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..MAX_ARG_PAYLOAD),
            dest_v4 in any::<[u8; 4]>()
        ) {
            let message = Message::SendPing {
                conn_id,
                packet: ProbePacket::request(seq, &payload),
                dest: IpAddr::from(dest_v4),
                ttl,
            };
            let bytes = message.encode();
            let (decoded, consumed) = Message::decode(&bytes).unwrap();
            prop_assert_eq!(message, decoded);
            prop_assert_eq!(bytes.len(), consumed);
            prop_assert!(bytes.len() <= MAX_ENVELOPE_LEN);
        }
    }
}
