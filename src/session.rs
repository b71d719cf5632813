//! Chooses where socket I/O happens: in this process, or in a
//! privilege-separated subprocess when the binary runs setuid.

use std::net::IpAddr;
use std::time::Duration;

use crate::backend::{self, BackendKind, Conn, ProbeConnection};
use crate::err::ProbeError;
use crate::packet::ProbePacket;
use crate::privsep::{self, Client, ClientConn};
use crate::transport::IpVersion;

/// Factory for probe connections.
pub enum Session {
    /// Sockets are opened directly in this process.
    Direct,
    /// Sockets live in the privileged subprocess.
    Privsep(Client),
}

impl Session {
    /// Detects the invocation mode. A setuid invocation spawns the
    /// privileged server and sheds the extra privilege immediately.
    pub async fn new() -> Result<Session, ProbeError> {
        if privsep::needs_privsep() {
            Ok(Session::Privsep(Client::spawn_privileged().await?))
        } else {
            Ok(Session::Direct)
        }
    }

    /// Opens a probe connection of the given kind and IP version.
    pub async fn open(
        &self,
        kind: BackendKind,
        version: IpVersion,
    ) -> Result<SessionConn, ProbeError> {
        match self {
            Session::Direct => Ok(SessionConn::Direct(backend::open(kind, version)?)),
            Session::Privsep(client) => {
                Ok(SessionConn::Privsep(client.open(version, kind).await?))
            }
        }
    }

    /// Ends the session; asks a privileged server to exit.
    pub async fn shutdown(&self) -> Result<(), ProbeError> {
        match self {
            Session::Direct => Ok(()),
            Session::Privsep(client) => client.shutdown().await,
        }
    }
}

/// A connection from either mode.
pub enum SessionConn {
    Direct(Conn),
    Privsep(ClientConn),
}

impl ProbeConnection for SessionConn {
    async fn send(
        &self,
        packet: &ProbePacket,
        dest: IpAddr,
        ttl: Option<u8>,
    ) -> Result<(), ProbeError> {
        match self {
            SessionConn::Direct(conn) => conn.send(packet, dest, ttl).await,
            SessionConn::Privsep(conn) => conn.send(packet, dest, ttl).await,
        }
    }

    async fn recv(&self, timeout: Duration) -> Result<(ProbePacket, IpAddr), ProbeError> {
        match self {
            SessionConn::Direct(conn) => conn.recv(timeout).await,
            SessionConn::Privsep(conn) => conn.recv(timeout).await,
        }
    }

    async fn close(&self) -> Result<(), ProbeError> {
        match self {
            SessionConn::Direct(conn) => conn.close().await,
            SessionConn::Privsep(conn) => conn.close().await,
        }
    }

    fn advance_base_port(&self, delta: u16) {
        match self {
            SessionConn::Direct(conn) => conn.advance_base_port(delta),
            // the privsep protocol has no port window message; sequence
            // numbers stay monotonic across attempts instead
            SessionConn::Privsep(_) => {}
        }
    }
}
