use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;

/// State of one probe slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResultKind {
    /// Sent, no resolution yet.
    Waiting,
    /// Echo reply received.
    Success,
    /// The timeout fired before any reply.
    Dropped,
    /// A second reply arrived for an already resolved probe. The slot
    /// keeps this kind and the probe is excluded from statistics.
    Duplicate,
    /// A router reported the probe's TTL as expired.
    TtlExceeded,
    /// The destination was reported unreachable.
    Unreachable,
}

/// Outcome of a single probe.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PingResult {
    pub kind: ResultKind,
    /// Sequence number the probe was sent with.
    pub seq: u16,
    /// When the probe left.
    pub sent_at: Instant,
    /// Round trip time, populated on resolution.
    pub latency: Option<Duration>,
    /// Address the reply came from, populated on reply.
    pub peer: Option<IpAddr>,
}

impl PingResult {
    pub(crate) fn waiting(seq: u16, sent_at: Instant) -> PingResult {
        PingResult {
            kind: ResultKind::Waiting,
            seq,
            sent_at,
            latency: None,
            peer: None,
        }
    }

    /// Glyph a plain text display uses for this slot.
    pub fn glyph(&self) -> char {
        match self.kind {
            ResultKind::Waiting => '.',
            ResultKind::Success => '!',
            ResultKind::Dropped => '?',
            ResultKind::Duplicate => 'D',
            ResultKind::TtlExceeded => 'T',
            ResultKind::Unreachable => 'X',
        }
    }
}
