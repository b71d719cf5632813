use std::net::IpAddr;

use super::{FrameError, ParseError};

/// Application level error taxonomy of the probing engine.
///
/// `Timeout` is a sentinel rather than a failure: the pinger converts it to
/// a dropped probe and the traceroute skips the hop. Everything else is
/// fatal for the connection that produced it.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The receive deadline expired without a matching reply.
    #[error("probe timed out")]
    Timeout,

    /// The connection was closed (locally or by the privsep server).
    #[error("connection closed")]
    Closed,

    /// Opening the transport would exceed the process wide socket cap.
    #[error("too many open probe sockets")]
    TooManySockets,

    /// The transport's token bucket is empty.
    #[error("probe rate limit exceeded")]
    RateLimited,

    /// A traceroute attempt ran past its maximum time-to-live without
    /// the destination answering.
    #[error("no answer from the destination within {0} hops")]
    MaxTtlReached(u8),

    /// A router reported the destination as unreachable.
    #[error("destination unreachable (reported by {0})")]
    Unreachable(IpAddr),

    /// Spawning or talking to the privileged subprocess failed.
    #[error("privilege separation failure: {0}")]
    Privsep(String),

    /// Malformed network frame. Receive loops treat this as skippable.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Malformed privsep protocol message.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Operating system error on the socket or pipe.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// True for the receive deadline sentinel.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout)
    }
}
