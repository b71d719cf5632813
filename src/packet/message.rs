/// Parsed form of an inbound ICMP frame, shared between the v4 and v6
/// codecs.
///
/// Only the messages the probing engine reacts to are modeled; everything
/// else lands in `Other` and is skipped by the receive loops.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IcmpMessage<'a> {
    /// An echo request. Seen on the receive path only as a loopback
    /// artifact (macOS IPv6); receive loops discard it.
    EchoRequest(Echo<'a>),
    /// An echo reply to one of our requests (if the id matches).
    EchoReply(Echo<'a>),
    /// Time-to-live expired at a router. Carries the identifiers
    /// extracted from the embedded offending packet.
    TimeExceeded(EmbeddedProbe),
    /// Destination unreachable. `code` is the raw ICMP code; the UDP
    /// backend needs it to tell port-unreachable from the rest.
    DestinationUnreachable {
        /// Raw ICMP code byte.
        code: u8,
        /// Identifiers of the offending packet.
        embedded: EmbeddedProbe,
    },
    /// Any other ICMP message. Skipped.
    Other,
}

/// Contents of an ICMP echo message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Echo<'a> {
    /// Echo identifier demultiplexing concurrent sessions.
    pub id: u16,
    /// Sequence number.
    pub seq: u16,
    /// Echo data.
    pub payload: &'a [u8],
}

/// Identifiers recovered from the packet embedded in an ICMP error body
/// (the IP header plus the first eight bytes of the offending packet).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EmbeddedProbe {
    /// The offending packet was one of our ICMP echo requests.
    IcmpEcho {
        /// Echo identifier of the embedded request.
        id: u16,
        /// Sequence number of the embedded request.
        seq: u16,
    },
    /// The offending packet was a UDP probe. The destination port
    /// carries the sequence number (`base_port + seq`), the source
    /// port identifies the sending connection.
    Udp {
        /// Source port of the embedded datagram.
        source_port: u16,
        /// Destination port of the embedded datagram.
        destination_port: u16,
    },
}
