/// Error while decoding an inbound ICMP, ICMPv6 or UDP frame.
///
/// A `ParseError` never closes the socket it was read from. Receive loops
/// log the value and continue with the next frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// Not enough bytes to decode the element named in `what`.
    UnexpectedEndOfSlice {
        /// Description of the element that could not be decoded.
        what: &'static str,
        /// Minimum number of bytes that would have been required.
        required_len: usize,
        /// Number of bytes that were actually present.
        len: usize,
    },

    /// The version nibble of an (embedded) IP header did not match
    /// the IP version of the connection the frame was received on.
    UnexpectedIpVersion {
        /// Version nibble found in the header.
        version: u8,
    },

    /// An ICMP error body embedded a packet of a protocol the backend
    /// does not probe with (neither ICMP echo nor UDP).
    UnexpectedEmbeddedProtocol {
        /// Protocol number found in the embedded IP header.
        protocol: u8,
    },

    /// An ICMP error body embedded an ICMP message that is not an
    /// echo request (e.g. an error within an error).
    UnexpectedEmbeddedIcmpType {
        /// ICMP type value of the embedded message.
        type_u8: u8,
    },
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use ParseError::*;
        match self {
            UnexpectedEndOfSlice {
                what,
                required_len,
                len,
            } => write!(
                f,
                "Not enough data to decode {} ({} byte(s) required, {} available).",
                what, required_len, len
            ),
            UnexpectedIpVersion { version } => write!(
                f,
                "IP header version {} does not match the connection's IP version.",
                version
            ),
            UnexpectedEmbeddedProtocol { protocol } => write!(
                f,
                "ICMP error embeds a packet of protocol {} (expected ICMP echo or UDP).",
                protocol
            ),
            UnexpectedEmbeddedIcmpType { type_u8 } => write!(
                f,
                "ICMP error embeds an ICMP message of type {} (expected an echo request).",
                type_u8
            ),
        }
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fmt() {
        let tests = [
            (
                ParseError::UnexpectedEndOfSlice {
                    what: "ICMPv4 header",
                    required_len: 8,
                    len: 3,
                },
                "Not enough data to decode ICMPv4 header (8 byte(s) required, 3 available).",
            ),
            (
                ParseError::UnexpectedIpVersion { version: 6 },
                "IP header version 6 does not match the connection's IP version.",
            ),
            (
                ParseError::UnexpectedEmbeddedProtocol { protocol: 6 },
                "ICMP error embeds a packet of protocol 6 (expected ICMP echo or UDP).",
            ),
            (
                ParseError::UnexpectedEmbeddedIcmpType { type_u8: 3 },
                "ICMP error embeds an ICMP message of type 3 (expected an echo request).",
            ),
        ];
        for (err, expected) in tests {
            assert_eq!(expected, format!("{}", err));
        }
    }

    #[test]
    fn clone_eq() {
        let err = ParseError::UnexpectedIpVersion { version: 5 };
        assert_eq!(err, err.clone());
    }
}
