/// Accumulator for the one's complement sum of 16 bit words used by the
/// checksum fields of ICMP, ICMPv6 and UDP (RFC 1071).
///
/// Words are added in network byte order. The final value returned by
/// [`Checksum::ones_complement`] is a plain integer; serialize it with
/// `to_be_bytes` when writing it into a packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    sum: u64,
}

impl Checksum {
    pub fn new() -> Checksum {
        Checksum { sum: 0 }
    }

    /// Add a single 16 bit word given as two big endian bytes.
    #[inline]
    pub fn add_2bytes(self, value: [u8; 2]) -> Checksum {
        Checksum {
            sum: self.sum + u64::from(u16::from_be_bytes(value)),
        }
    }

    /// Add two 16 bit words.
    #[inline]
    pub fn add_4bytes(self, value: [u8; 4]) -> Checksum {
        self.add_2bytes([value[0], value[1]])
            .add_2bytes([value[2], value[3]])
    }

    /// Add eight 16 bit words (e.g. one IPv6 address).
    #[inline]
    pub fn add_16bytes(self, value: [u8; 16]) -> Checksum {
        let mut sum = self;
        for word in value.chunks_exact(2) {
            sum = sum.add_2bytes([word[0], word[1]]);
        }
        sum
    }

    /// Add the given slice. A slice with an odd length is padded
    /// with a zero byte at the end.
    pub fn add_slice(self, slice: &[u8]) -> Checksum {
        let mut sum = self;
        let mut chunks = slice.chunks_exact(2);
        for word in &mut chunks {
            sum = sum.add_2bytes([word[0], word[1]]);
        }
        if let [last] = chunks.remainder() {
            sum = sum.add_2bytes([*last, 0]);
        }
        sum
    }

    /// Fold the carries and return the one's complement of the sum.
    pub fn ones_complement(self) -> u16 {
        let mut sum = self.sum;
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }

    /// Like [`Checksum::ones_complement`] but maps the result 0 to 0xffff.
    ///
    /// The UDP checksum field uses 0 as the "no checksum" marker, so a
    /// computed checksum of 0 must be transmitted as 0xffff (RFC 768).
    pub fn ones_complement_with_no_zero(self) -> u16 {
        match self.ones_complement() {
            0 => 0xffff,
            value => value,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new() {
        assert_eq!(Checksum::new(), Checksum::default());
        assert_eq!(0xffff, Checksum::new().ones_complement());
    }

    #[test]
    fn carry_folding() {
        // 0xffff + 0x0001 wraps around to 0x0001 in one's complement
        // arithmetic, so the complement is 0xfffe.
        assert_eq!(
            0xfffe,
            Checksum::new()
                .add_2bytes([0xff, 0xff])
                .add_2bytes([0x00, 0x01])
                .ones_complement()
        );
    }

    #[test]
    fn rfc1071_example() {
        // Example words from RFC 1071 section 3.
        let sum = Checksum::new()
            .add_2bytes([0x00, 0x01])
            .add_2bytes([0xf2, 0x03])
            .add_2bytes([0xf4, 0xf5])
            .add_2bytes([0xf6, 0xf7]);
        assert_eq!(!0xddf2u16, sum.ones_complement());
    }

    #[test]
    fn no_zero_mapping() {
        // The all-ones input sums to 0xffff whose complement is 0.
        let sum = Checksum::new().add_2bytes([0xff, 0xff]);
        assert_eq!(0, sum.ones_complement());
        assert_eq!(0xffff, sum.ones_complement_with_no_zero());
    }

    proptest! {
        #[test]
        fn add_slice_matches_words(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let by_slice = Checksum::new().add_slice(&data).ones_complement();
            let mut by_words = Checksum::new();
            let mut chunks = data.chunks_exact(2);
            for word in &mut chunks {
                by_words = by_words.add_2bytes([word[0], word[1]]);
            }
            if let [last] = chunks.remainder() {
                by_words = by_words.add_2bytes([*last, 0]);
            }
            prop_assert_eq!(by_slice, by_words.ones_complement());
        }

        #[test]
        fn order_independent(a in any::<[u8;2]>(), b in any::<[u8;2]>(), c in any::<[u8;4]>()) {
            prop_assert_eq!(
                Checksum::new().add_2bytes(a).add_2bytes(b).add_4bytes(c).ones_complement(),
                Checksum::new().add_4bytes(c).add_2bytes(b).add_2bytes(a).ones_complement()
            );
        }
    }
}
