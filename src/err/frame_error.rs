/// Error while decoding a privilege separation protocol message.
///
/// Decoding is deliberately strict on both sides of the pipe. The
/// privileged server terminates on the first `FrameError` it reads; the
/// unprivileged client logs the error and skips the message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FrameError {
    /// The stream ended in the middle of a message.
    UnexpectedEof,

    /// The type byte is not a known message kind.
    UnknownMessageType(u8),

    /// The message carried a different number of arguments than its
    /// kind requires.
    UnexpectedArgCount {
        /// Message kind (type byte).
        message_type: u8,
        /// Argument count required by the message kind.
        expected: u8,
        /// Argument count found in the envelope.
        actual: u8,
    },

    /// An argument had a length its schema does not permit.
    UnexpectedArgLen {
        /// Description of the argument.
        what: &'static str,
        /// Length found on the wire.
        len: usize,
    },

    /// An argument carried a value outside its schema (e.g. an IP
    /// version byte that is neither 4 nor 6).
    InvalidArgValue {
        /// Description of the argument.
        what: &'static str,
        /// First byte of the offending value.
        value: u8,
    },

    /// A packet argument was shorter than its own length field claims,
    /// or carried trailing bytes.
    InvalidPacketEncoding {
        /// Length of the packet argument on the wire.
        len: usize,
    },

    /// A packet argument carried an unknown probe kind value.
    UnknownProbeKind(u8),

    /// An address argument was neither 4 (IPv4) nor 16 (IPv6) bytes.
    InvalidAddressLen(usize),
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use FrameError::*;
        match self {
            UnexpectedEof => write!(f, "Stream ended in the middle of a message."),
            UnknownMessageType(t) => write!(f, "Unknown message type {}.", t),
            UnexpectedArgCount {
                message_type,
                expected,
                actual,
            } => write!(
                f,
                "Message type {} requires {} argument(s) but carried {}.",
                message_type, expected, actual
            ),
            UnexpectedArgLen { what, len } => {
                write!(f, "Argument '{}' has unsupported length {}.", what, len)
            }
            InvalidArgValue { what, value } => {
                write!(f, "Argument '{}' has invalid value {}.", what, value)
            }
            InvalidPacketEncoding { len } => {
                write!(f, "Packet argument of length {} is inconsistent.", len)
            }
            UnknownProbeKind(k) => write!(f, "Unknown probe kind value {}.", k),
            InvalidAddressLen(len) => write!(
                f,
                "Address argument must be 4 or 16 bytes long (got {}).",
                len
            ),
        }
    }
}

impl std::error::Error for FrameError {}
