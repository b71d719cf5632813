//! Wire codecs for the probe protocols.
//!
//! Everything in this module is pure: build and parse functions over byte
//! slices, no sockets. The transport layer decides which codec to call and
//! whether a leading IP header must be stripped first.

mod probe_kind;
pub use probe_kind::*;

mod probe_packet;
pub use probe_packet::*;

mod message;
pub use message::*;

pub mod icmp_v4;
pub mod icmp_v6;

mod udp_header;
pub use udp_header::*;
