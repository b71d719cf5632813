//! Privilege separation.
//!
//! Raw socket access may need more privilege than the rest of the
//! program should carry. When the binary runs setuid, the unprivileged
//! [`Client`] re-executes it with [`SERVER_SENTINEL`] as the only
//! argument and a cleared environment; the resulting [`server`] keeps
//! the privilege, owns the sockets, and speaks the framed
//! [`Message`] protocol over its standard input and output.

mod message;
pub use message::*;

pub mod server;

mod client;
pub use client::*;

use crate::err::ProbeError;

/// Argument marking a process as the privileged server.
pub const SERVER_SENTINEL: &str = "__pingtop-privsep-server";

/// Whether this invocation should route socket I/O through a privileged
/// subprocess: only when we run with an effective uid of root that the
/// invoking user does not own (the setuid case).
pub fn needs_privsep() -> bool {
    let uid = unsafe { libc::getuid() };
    let euid = unsafe { libc::geteuid() };
    euid == 0 && uid != 0
}

/// Drops to the real uid and verifies the drop cannot be undone.
pub fn drop_privileges() -> Result<(), ProbeError> {
    let uid = unsafe { libc::getuid() };
    let euid = unsafe { libc::geteuid() };
    if uid == euid {
        return Ok(());
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(ProbeError::Privsep(format!(
            "setuid({}) failed: {}",
            uid,
            std::io::Error::last_os_error()
        )));
    }
    // the drop must be permanent: regaining the old effective uid has
    // to fail now
    if unsafe { libc::seteuid(euid) } == 0 {
        return Err(ProbeError::Privsep(
            "privilege drop did not stick".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drop_is_a_noop_without_privilege() {
        // uid == euid in a test run, so this must succeed and change
        // nothing
        assert!(drop_privileges().is_ok());
    }

    #[test]
    fn privsep_not_needed_without_privilege() {
        assert!(!needs_privsep());
    }
}
