use crate::checksum::Checksum;
use crate::err::ParseError;

/// UDP header according to RFC 768.
///
/// The checksum is calculated from a pseudo-header (source and
/// destination address, protocol number, length), the header itself and
/// the payload. Received checksums are not verified here: the kernel
/// already validated directly received datagrams, and for the header
/// bytes recovered from an ICMP error body the field is informational
/// and may be zero.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UdpHeader {
    /// Source port of the datagram.
    pub source_port: u16,
    /// Destination port of the datagram.
    pub destination_port: u16,
    /// Total length including the 8 header bytes.
    pub length: u16,
    /// Internet checksum (0 = not computed).
    pub checksum: u16,
}

/// IP protocol number of UDP, used in the checksum pseudo-header.
const IP_PROTO_UDP: u8 = 17;

impl UdpHeader {
    /// Serialized size of a UDP header in bytes/octets.
    pub const LEN: usize = 8;

    /// Header for the given ports and payload with the checksum
    /// computed over the IPv4 pseudo-header.
    ///
    /// Probe payloads are bounded well below the field limits, so the
    /// length always fits.
    pub fn with_ipv4_checksum(
        source_port: u16,
        destination_port: u16,
        source: [u8; 4],
        destination: [u8; 4],
        payload: &[u8],
    ) -> UdpHeader {
        debug_assert!(payload.len() + UdpHeader::LEN <= usize::from(u16::MAX));
        let mut header = UdpHeader {
            source_port,
            destination_port,
            length: (UdpHeader::LEN + payload.len()) as u16,
            checksum: 0,
        };
        header.checksum = header.checksum_post_ip(
            Checksum::new()
                .add_4bytes(source)
                .add_4bytes(destination)
                .add_2bytes([0, IP_PROTO_UDP])
                .add_2bytes(header.length.to_be_bytes()),
            payload,
        );
        header
    }

    /// Header for the given ports and payload with the checksum
    /// computed over the IPv6 pseudo-header.
    pub fn with_ipv6_checksum(
        source_port: u16,
        destination_port: u16,
        source: [u8; 16],
        destination: [u8; 16],
        payload: &[u8],
    ) -> UdpHeader {
        debug_assert!(payload.len() + UdpHeader::LEN <= usize::from(u16::MAX));
        let mut header = UdpHeader {
            source_port,
            destination_port,
            length: (UdpHeader::LEN + payload.len()) as u16,
            checksum: 0,
        };
        header.checksum = header.checksum_post_ip(
            Checksum::new()
                .add_16bytes(source)
                .add_16bytes(destination)
                .add_4bytes(u32::from(header.length).to_be_bytes())
                .add_4bytes([0, 0, 0, IP_PROTO_UDP]),
            payload,
        );
        header
    }

    /// Finishes a checksum whose pseudo-header part is already summed.
    fn checksum_post_ip(&self, pseudo_header_sum: Checksum, payload: &[u8]) -> u16 {
        pseudo_header_sum
            .add_2bytes(self.source_port.to_be_bytes())
            .add_2bytes(self.destination_port.to_be_bytes())
            .add_2bytes(self.length.to_be_bytes())
            .add_slice(payload)
            .ones_complement_with_no_zero()
    }

    /// Reads a header from a static sized byte array.
    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> UdpHeader {
        UdpHeader {
            source_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            destination_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            checksum: u16::from_be_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Reads a header from the first 8 bytes of the slice.
    pub fn from_slice(slice: &[u8]) -> Result<UdpHeader, ParseError> {
        if slice.len() < UdpHeader::LEN {
            return Err(ParseError::UnexpectedEndOfSlice {
                what: "UDP header",
                required_len: UdpHeader::LEN,
                len: slice.len(),
            });
        }
        Ok(UdpHeader::from_bytes([
            slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
        ]))
    }

    /// Returns the serialized form of the header.
    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        let source_port_be = self.source_port.to_be_bytes();
        let destination_port_be = self.destination_port.to_be_bytes();
        let length_be = self.length.to_be_bytes();
        let checksum_be = self.checksum.to_be_bytes();
        [
            source_port_be[0],
            source_port_be[1],
            destination_port_be[0],
            destination_port_be[1],
            length_be[0],
            length_be[1],
            checksum_be[0],
            checksum_be[1],
        ]
    }
}
