use std::net::IpAddr;

/// ICMP error delivered through the socket error queue instead of the
/// normal receive path (Linux `IP_RECVERR` / `IPV6_RECVERR`).
///
/// `ee_type`/`ee_code` use the numbering of whichever ICMP version the
/// socket speaks; classification happens once, at the backend boundary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrQueueEvent {
    /// ICMP type byte of the error message.
    pub ee_type: u8,
    /// ICMP code byte of the error message.
    pub ee_code: u8,
    /// Router that generated the error (`SO_EE_OFFENDER`). The sockaddr
    /// returned by `recvmsg` itself holds the *original destination*,
    /// not the router.
    pub offender: Option<IpAddr>,
    /// Destination port of the offending datagram, recovered from the
    /// original-destination sockaddr. For UDP probes this carries
    /// `base_port + seq`.
    pub orig_dest_port: Option<u16>,
    /// Payload returned alongside the error: the offending packet as it
    /// was handed to `send` (ICMP message or UDP payload).
    pub data: Vec<u8>,
}
