/// Classification of a probe packet.
///
/// `EchoRequest` is the only kind senders produce. The three reply kinds
/// are produced by the parsers; which one a frame maps to is decided once,
/// at the backend boundary.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProbeKind {
    /// Outbound probe.
    EchoRequest = 0,
    /// The destination answered. For UDP probes this is synthesized from
    /// an ICMP port-unreachable (the traceroute arrival signal).
    EchoReply = 1,
    /// A router on the path dropped the probe because its TTL expired.
    TimeExceeded = 2,
    /// The destination is unreachable for a reason other than the
    /// probe port being closed.
    DestinationUnreachable = 3,
}

impl ProbeKind {
    /// Converts a wire value of the privsep packet encoding back into
    /// a [`ProbeKind`]. Returns [`None`] for unknown values.
    #[inline]
    pub fn from_u8(value: u8) -> Option<ProbeKind> {
        use ProbeKind::*;
        match value {
            0 => Some(EchoRequest),
            1 => Some(EchoReply),
            2 => Some(TimeExceeded),
            3 => Some(DestinationUnreachable),
            _ => None,
        }
    }

    /// Wire value used by the privsep packet encoding.
    #[inline]
    pub fn kind_u8(&self) -> u8 {
        *self as u8
    }
}
