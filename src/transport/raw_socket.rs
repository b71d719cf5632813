use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::sync::{Notify, OwnedSemaphorePermit, RwLock};
use tracing::trace;

use crate::err::ProbeError;

use super::{acquire_transport_slot, ErrQueueEvent, IpVersion, RateLimiter};

/// Largest frame the receive path accepts. Generous for an ICMP error
/// carrying the embedded header plus our bounded payloads.
pub const MAX_FRAME: usize = 4096;

/// How the socket was opened. Decides whether received v4 frames carry
/// a leading IP header and where the echo identifier comes from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketKind {
    /// Unprivileged datagram ICMP socket ("ping socket").
    IcmpDgram,
    /// Raw ICMP socket (requires privilege, fallback path).
    IcmpRaw,
    /// Plain UDP datagram socket.
    Udp,
}

/// A frame delivered by [`RawSocket::recv_from`]: either a packet from
/// the network or an ICMP error drained from the Linux error queue.
#[derive(Clone, Debug)]
pub enum RecvEvent {
    Packet { bytes: Vec<u8>, peer: IpAddr },
    Error(ErrQueueEvent),
}

/// Async wrapper around one probing socket.
///
/// A `RawSocket` is exclusively owned by one backend connection. Sends
/// and receives may run concurrently; closing unblocks an in-flight
/// receive with [`ProbeError::Closed`].
#[derive(Debug)]
pub struct RawSocket {
    io: AsyncFd<Socket>,
    version: IpVersion,
    kind: SocketKind,
    ident: u16,
    /// TTL is a socket wide property: overriding it takes this lock
    /// exclusively, ordinary sends take it shared so the common case
    /// stays parallel.
    ttl_lock: RwLock<()>,
    limiter: RateLimiter,
    closed: AtomicBool,
    close_notify: Notify,
    _slot: OwnedSemaphorePermit,
}

impl RawSocket {
    /// Opens an ICMP echo socket for the given IP version.
    ///
    /// Prefers the unprivileged datagram variant and falls back to a
    /// raw socket when the kernel refuses (no `ping_group_range`
    /// membership, BSD-style platforms).
    pub fn open_icmp(version: IpVersion) -> Result<RawSocket, ProbeError> {
        let slot = acquire_transport_slot()?;
        let protocol = match version {
            IpVersion::V4 => Protocol::ICMPV4,
            IpVersion::V6 => Protocol::ICMPV6,
        };
        let (socket, kind) = match Socket::new(version.domain(), Type::DGRAM, Some(protocol)) {
            Ok(socket) => (socket, SocketKind::IcmpDgram),
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EPROTONOSUPPORT)
                ) =>
            {
                (
                    Socket::new(version.domain(), Type::RAW, Some(protocol))?,
                    SocketKind::IcmpRaw,
                )
            }
            Err(err) => return Err(err.into()),
        };
        socket.set_nonblocking(true)?;

        let ident = match kind {
            SocketKind::IcmpDgram if cfg!(target_os = "linux") => {
                // the kernel picks the echo identifier and reports it as
                // the bound "port"
                socket.bind(&SockAddr::from(SocketAddr::new(version.unspecified(), 0)))?;
                socket
                    .local_addr()?
                    .as_socket()
                    .map(|addr| addr.port())
                    .unwrap_or_else(rand::random)
            }
            _ => rand::random(),
        };

        #[cfg(target_os = "linux")]
        enable_recv_err(&socket, version)?;
        #[cfg(target_os = "macos")]
        if kind == SocketKind::IcmpDgram && version == IpVersion::V4 {
            setsockopt_int(&socket, libc::IPPROTO_IP, libc::IP_STRIPHDR, 1)?;
        }

        Ok(RawSocket {
            io: AsyncFd::new(socket)?,
            version,
            kind,
            ident,
            ttl_lock: RwLock::new(()),
            limiter: RateLimiter::default(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            _slot: slot,
        })
    }

    /// Opens a UDP probe socket bound to `desired_local_port` (0 lets
    /// the kernel choose). The bound port identifies the connection in
    /// ICMP error bodies.
    pub fn open_udp(version: IpVersion, desired_local_port: u16) -> Result<RawSocket, ProbeError> {
        let slot = acquire_transport_slot()?;
        let socket = Socket::new(version.domain(), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(SocketAddr::new(
            version.unspecified(),
            desired_local_port,
        )))?;
        let ident = socket
            .local_addr()?
            .as_socket()
            .map(|addr| addr.port())
            .unwrap_or(desired_local_port);

        #[cfg(target_os = "linux")]
        enable_recv_err(&socket, version)?;

        Ok(RawSocket {
            io: AsyncFd::new(socket)?,
            version,
            kind: SocketKind::Udp,
            ident,
            ttl_lock: RwLock::new(()),
            limiter: RateLimiter::default(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            _slot: slot,
        })
    }

    /// Echo identifier (ICMP) or bound source port (UDP).
    pub fn ident(&self) -> u16 {
        self.ident
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Whether received v4 frames start with the IP header.
    pub fn includes_ip_header(&self) -> bool {
        self.version == IpVersion::V4 && self.kind == SocketKind::IcmpRaw
    }

    /// Sends `buf` to `dest`, optionally with a one-shot TTL override.
    ///
    /// The override reads the socket's current TTL, sets the requested
    /// one, sends, and restores the original, all under the exclusive
    /// side of the TTL lock.
    pub async fn send_to(
        &self,
        buf: &[u8],
        dest: SocketAddr,
        ttl: Option<u8>,
    ) -> Result<(), ProbeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProbeError::Closed);
        }
        self.limiter.try_acquire()?;
        match ttl {
            None => {
                let _shared = self.ttl_lock.read().await;
                self.send_inner(buf, dest).await
            }
            Some(ttl) => {
                let _exclusive = self.ttl_lock.write().await;
                let previous = self.ttl()?;
                self.set_ttl(u32::from(ttl))?;
                let result = self.send_inner(buf, dest).await;
                self.set_ttl(previous)?;
                result
            }
        }
    }

    fn ttl(&self) -> io::Result<u32> {
        match self.version {
            IpVersion::V4 => self.io.get_ref().ttl(),
            IpVersion::V6 => self.io.get_ref().unicast_hops_v6(),
        }
    }

    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        match self.version {
            IpVersion::V4 => self.io.get_ref().set_ttl(ttl),
            IpVersion::V6 => self.io.get_ref().set_unicast_hops_v6(ttl),
        }
    }

    async fn send_inner(&self, buf: &[u8], dest: SocketAddr) -> Result<(), ProbeError> {
        let addr = SockAddr::from(dest);
        loop {
            let mut guard = self.io.writable().await?;
            match guard.try_io(|io| io.get_ref().send_to(buf, &addr)) {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(err)) => {
                    // with RECVERR enabled a queued ICMP error surfaces
                    // on the next syscall; the receive path will drain
                    // it, the datagram itself still left
                    if is_pending_icmp_error(&err) {
                        return Ok(());
                    }
                    return Err(err.into());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receives one frame, waiting at most `timeout`.
    ///
    /// Returns the [`ProbeError::Timeout`] sentinel on deadline and
    /// [`ProbeError::Closed`] once [`RawSocket::close`] was called.
    pub async fn recv_from(&self, timeout: Duration) -> Result<RecvEvent, ProbeError> {
        match tokio::time::timeout(timeout, self.recv_inner()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ProbeError::Timeout),
        }
    }

    async fn recv_inner(&self) -> Result<RecvEvent, ProbeError> {
        let mut buf = [0u8; MAX_FRAME];
        loop {
            let notified = self.close_notify.notified();
            tokio::pin!(notified);
            // register before checking the flag so a concurrent close
            // is seen either way
            notified.as_mut().enable();
            if self.closed.load(Ordering::Acquire) {
                return Err(ProbeError::Closed);
            }
            let mut guard = tokio::select! {
                guard = self.io.readable() => guard?,
                _ = &mut notified => return Err(ProbeError::Closed),
            };
            match guard.try_io(|io| recv_from_into(io.get_ref(), &mut buf)) {
                Ok(Ok((n, addr))) => {
                    let peer = match addr.as_socket() {
                        Some(addr) => addr.ip(),
                        // raw sockets may hand back a bare sockaddr; skip
                        None => continue,
                    };
                    return Ok(RecvEvent::Packet {
                        bytes: buf[..n].to_vec(),
                        peer,
                    });
                }
                Ok(Err(err)) => {
                    #[cfg(target_os = "linux")]
                    if is_pending_icmp_error(&err) {
                        match super::err_queue::recv_err(self.io.get_ref().as_raw_fd(), self.version)?
                        {
                            Some(event) => return Ok(RecvEvent::Error(event)),
                            None => continue,
                        }
                    }
                    return Err(err.into());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Marks the socket closed and unblocks pending receives.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            trace!(ident = self.ident, "closing probe socket");
            self.close_notify.notify_waiters();
        }
    }
}

/// Errors a `RECVERR`-enabled socket reports when an ICMP error is
/// queued for it.
fn is_pending_icmp_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EHOSTUNREACH)
            | Some(libc::ENETUNREACH)
            | Some(libc::ECONNREFUSED)
            | Some(libc::EPROTO)
    )
}

/// `recv_from` into an initialized buffer.
///
/// Safety: `recv` never writes uninitialized bytes into the buffer, so
/// viewing it as `MaybeUninit<u8>` is sound (socket2 offers no
/// `&mut [u8]` variant).
fn recv_from_into(socket: &Socket, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    socket.recv_from(uninit)
}

#[cfg(target_os = "linux")]
fn enable_recv_err(socket: &Socket, version: IpVersion) -> io::Result<()> {
    match version {
        IpVersion::V4 => setsockopt_int(socket, libc::IPPROTO_IP, libc::IP_RECVERR, 1),
        IpVersion::V6 => setsockopt_int(socket, libc::IPPROTO_IPV6, libc::IPV6_RECVERR, 1),
    }
}

#[allow(dead_code)]
fn setsockopt_int(socket: &Socket, level: i32, name: i32, value: i32) -> io::Result<()> {
    let res = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            (&value as *const i32).cast(),
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // UDP sockets need no privilege, so the TTL restore invariant and
    // the close semantics are testable everywhere.

    #[tokio::test]
    async fn udp_open_reports_local_port() {
        let socket = RawSocket::open_udp(IpVersion::V4, 0).unwrap();
        assert_ne!(0, socket.ident());
        assert_eq!(SocketKind::Udp, socket.kind());
        assert!(!socket.includes_ip_header());
    }

    #[tokio::test]
    async fn ttl_restored_after_override() {
        let socket = RawSocket::open_udp(IpVersion::V4, 0).unwrap();
        let before = socket.ttl().unwrap();
        socket
            .send_to(b"probe", "127.0.0.1:33434".parse().unwrap(), Some(3))
            .await
            .unwrap();
        assert_eq!(before, socket.ttl().unwrap());
    }

    #[tokio::test]
    async fn plain_send_keeps_ttl() {
        let socket = RawSocket::open_udp(IpVersion::V4, 0).unwrap();
        let before = socket.ttl().unwrap();
        socket
            .send_to(b"probe", "127.0.0.1:33434".parse().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(before, socket.ttl().unwrap());
    }

    #[tokio::test]
    async fn close_unblocks_receive() {
        let socket = std::sync::Arc::new(RawSocket::open_udp(IpVersion::V4, 0).unwrap());
        let receiver = socket.clone();
        let task = tokio::spawn(async move {
            receiver.recv_from(Duration::from_secs(30)).await
        });
        tokio::task::yield_now().await;
        socket.close();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ProbeError::Closed)));
    }

    #[tokio::test]
    async fn recv_times_out() {
        let socket = RawSocket::open_udp(IpVersion::V4, 0).unwrap();
        let result = socket.recv_from(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ProbeError::Timeout)));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let socket = RawSocket::open_udp(IpVersion::V4, 0).unwrap();
        socket.close();
        let result = socket
            .send_to(b"x", "127.0.0.1:9".parse().unwrap(), None)
            .await;
        assert!(matches!(result, Err(ProbeError::Closed)));
    }
}
