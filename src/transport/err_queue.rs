//! Linux socket error queue (`MSG_ERRQUEUE`) decoding.
//!
//! With `IP_RECVERR`/`IPV6_RECVERR` enabled the kernel parks inbound ICMP
//! errors on a per socket queue together with ancillary metadata. The
//! layout of the extended error control message is encoded explicitly
//! here instead of trusting any particular libc version to carry it.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use super::{ErrQueueEvent, IpVersion};

/// `ee_origin` value for errors carried by ICMPv4.
const SO_EE_ORIGIN_ICMP: u8 = 2;

/// `ee_origin` value for errors carried by ICMPv6.
const SO_EE_ORIGIN_ICMP6: u8 = 3;

/// `struct sock_extended_err` from `linux/errqueue.h`. The offending
/// router's sockaddr follows directly after it in the control message
/// (`SO_EE_OFFENDER`).
#[repr(C)]
#[derive(Clone, Copy)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

/// Reads one event off the error queue without blocking.
///
/// Returns `Ok(None)` when the queue is empty (the caller saw a spurious
/// wakeup) or when the queued error did not originate from ICMP.
pub(crate) fn recv_err(fd: RawFd, version: IpVersion) -> io::Result<Option<ErrQueueEvent>> {
    let mut data = [0u8; 2048];
    let mut name: libc::sockaddr_storage = unsafe { mem::zeroed() };
    // sized for the extended error control structure plus the sockaddr
    // of the offending router
    let mut control = [0u8; 512];

    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = (&mut name as *mut libc::sockaddr_storage).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control.len();

    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }

    let mut found: Option<(SockExtendedErr, Option<IpAddr>)> = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let cmsg_type = (*cmsg).cmsg_type;
            let matches_version = match version {
                IpVersion::V4 => level == libc::IPPROTO_IP && cmsg_type == libc::IP_RECVERR,
                IpVersion::V6 => level == libc::IPPROTO_IPV6 && cmsg_type == libc::IPV6_RECVERR,
            };
            if matches_version {
                let payload = libc::CMSG_DATA(cmsg);
                let ee: SockExtendedErr = std::ptr::read_unaligned(payload.cast());
                let offender_ptr = payload.add(mem::size_of::<SockExtendedErr>());
                let offender = read_offender(offender_ptr.cast());
                found = Some((ee, offender));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let (ee, offender) = match found {
        Some(found) => found,
        None => return Ok(None),
    };
    if ee.ee_origin != SO_EE_ORIGIN_ICMP && ee.ee_origin != SO_EE_ORIGIN_ICMP6 {
        return Ok(None);
    }

    // msg_name holds the original destination of the offending packet,
    // which for UDP probes encodes the sequence in its port
    let orig_dest_port = sockaddr_storage_to_addr(&name).map(|addr| addr.port());

    Ok(Some(ErrQueueEvent {
        ee_type: ee.ee_type,
        ee_code: ee.ee_code,
        offender,
        orig_dest_port,
        data: data[..n as usize].to_vec(),
    }))
}

/// Reads the `SO_EE_OFFENDER` sockaddr stored after the extended error
/// structure. An `AF_UNSPEC` family means the kernel had no address.
unsafe fn read_offender(ptr: *const libc::sockaddr) -> Option<IpAddr> {
    match i32::from((*ptr).sa_family) {
        libc::AF_INET => {
            let sin: libc::sockaddr_in = std::ptr::read_unaligned(ptr.cast());
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let sin6: libc::sockaddr_in6 = std::ptr::read_unaligned(ptr.cast());
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

fn sockaddr_storage_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match i32::from(storage.ss_family) {
        libc::AF_INET => {
            let sin: libc::sockaddr_in =
                unsafe { std::ptr::read_unaligned((storage as *const libc::sockaddr_storage).cast()) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6: libc::sockaddr_in6 =
                unsafe { std::ptr::read_unaligned((storage as *const libc::sockaddr_storage).cast()) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extended_err_layout() {
        // field offsets must match linux/errqueue.h
        assert_eq!(16, mem::size_of::<SockExtendedErr>());
        assert_eq!(0, mem::offset_of!(SockExtendedErr, ee_errno));
        assert_eq!(4, mem::offset_of!(SockExtendedErr, ee_origin));
        assert_eq!(5, mem::offset_of!(SockExtendedErr, ee_type));
        assert_eq!(6, mem::offset_of!(SockExtendedErr, ee_code));
        assert_eq!(8, mem::offset_of!(SockExtendedErr, ee_info));
        assert_eq!(12, mem::offset_of!(SockExtendedErr, ee_data));
    }

    #[test]
    fn sockaddr_v4_round_trip() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 33445u16.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(Ipv4Addr::new(192, 0, 2, 9)).to_be(),
            },
            sin_zero: [0; 8],
        };
        unsafe {
            std::ptr::copy_nonoverlapping(
                (&sin as *const libc::sockaddr_in).cast::<u8>(),
                (&mut storage as *mut libc::sockaddr_storage).cast::<u8>(),
                mem::size_of::<libc::sockaddr_in>(),
            );
        }
        assert_eq!(
            Some("192.0.2.9:33445".parse::<SocketAddr>().unwrap()),
            sockaddr_storage_to_addr(&storage)
        );
    }

    #[test]
    fn sockaddr_v6_round_trip() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sin6.sin6_port = 33434u16.to_be();
        sin6.sin6_addr.s6_addr = Ipv6Addr::LOCALHOST.octets();
        unsafe {
            std::ptr::copy_nonoverlapping(
                (&sin6 as *const libc::sockaddr_in6).cast::<u8>(),
                (&mut storage as *mut libc::sockaddr_storage).cast::<u8>(),
                mem::size_of::<libc::sockaddr_in6>(),
            );
        }
        let addr = sockaddr_storage_to_addr(&storage).unwrap();
        assert_eq!(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.ip());
        assert_eq!(33434, addr.port());
    }

    #[test]
    fn unspec_family_is_none() {
        let storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        assert_eq!(None, sockaddr_storage_to_addr(&storage));
    }
}
