//! Probe backends: echo semantics on top of the raw transport.
//!
//! The set of backends is closed (ICMP echo, UDP, plus the privsep
//! client handle), so dispatch is a trait with static implementations
//! and one delegating enum, no plugin machinery.

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use crate::err::ProbeError;
use crate::packet::ProbePacket;
use crate::transport::IpVersion;

mod icmp;
pub use icmp::*;

mod udp;
pub use udp::*;

#[cfg(test)]
pub(crate) mod mock;

/// Which probe protocol a connection speaks.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BackendKind {
    /// ICMP echo request/reply.
    Icmp = 0,
    /// UDP datagrams to high ports, replies arrive as ICMP errors.
    Udp = 1,
}

impl BackendKind {
    /// Wire value used by the privsep protocol.
    #[inline]
    pub fn backend_u8(&self) -> u8 {
        *self as u8
    }

    /// Converts a privsep wire value back. Returns [`None`] for
    /// unknown values.
    #[inline]
    pub fn from_u8(value: u8) -> Option<BackendKind> {
        match value {
            0 => Some(BackendKind::Icmp),
            1 => Some(BackendKind::Udp),
            _ => None,
        }
    }
}

/// An open probe transport bound to one IP version and protocol.
///
/// Send and receive may be used concurrently; a connection is
/// exclusively owned by one pinger or traceroute.
pub trait ProbeConnection: Send + Sync + 'static {
    /// Sends a probe, optionally overriding the TTL for this packet.
    fn send(
        &self,
        packet: &ProbePacket,
        dest: IpAddr,
        ttl: Option<u8>,
    ) -> impl Future<Output = Result<(), ProbeError>> + Send;

    /// Waits up to `timeout` for the next reply belonging to this
    /// connection. Returns the [`ProbeError::Timeout`] sentinel on
    /// deadline.
    fn recv(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<(ProbePacket, IpAddr), ProbeError>> + Send;

    /// Closes the connection, unblocking concurrent receives.
    fn close(&self) -> impl Future<Output = Result<(), ProbeError>> + Send;

    /// Shifts the probe destination port window (UDP traceroute keeps
    /// `sequence -> port` unambiguous across retries this way). A no-op
    /// for backends without ports.
    fn advance_base_port(&self, _delta: u16) {}
}

/// Runtime-selected backend connection.
#[derive(Debug)]
pub enum Conn {
    Icmp(IcmpConn),
    Udp(UdpConn),
}

/// Opens a backend connection of the requested kind and IP version.
pub fn open(kind: BackendKind, version: IpVersion) -> Result<Conn, ProbeError> {
    match kind {
        BackendKind::Icmp => Ok(Conn::Icmp(IcmpConn::open(version)?)),
        BackendKind::Udp => Ok(Conn::Udp(UdpConn::open(version)?)),
    }
}

impl ProbeConnection for Conn {
    async fn send(
        &self,
        packet: &ProbePacket,
        dest: IpAddr,
        ttl: Option<u8>,
    ) -> Result<(), ProbeError> {
        match self {
            Conn::Icmp(conn) => conn.send(packet, dest, ttl).await,
            Conn::Udp(conn) => conn.send(packet, dest, ttl).await,
        }
    }

    async fn recv(&self, timeout: Duration) -> Result<(ProbePacket, IpAddr), ProbeError> {
        match self {
            Conn::Icmp(conn) => conn.recv(timeout).await,
            Conn::Udp(conn) => conn.recv(timeout).await,
        }
    }

    async fn close(&self) -> Result<(), ProbeError> {
        match self {
            Conn::Icmp(conn) => conn.close().await,
            Conn::Udp(conn) => conn.close().await,
        }
    }

    fn advance_base_port(&self, delta: u16) {
        match self {
            Conn::Icmp(conn) => conn.advance_base_port(delta),
            Conn::Udp(conn) => conn.advance_base_port(delta),
        }
    }
}
