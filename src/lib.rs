//! Probing core of `pingtop`, an interactive terminal monitor that
//! combines ping, traceroute and top: it continuously measures
//! reachability and latency of many hosts (and, on request, of every
//! router hop on the way) and feeds a live table of results.
//!
//! This crate is the measurement engine; rendering, name resolution
//! and argument handling are thin consumers on top of it. The pieces:
//!
//! * [`packet`] — pure codecs for ICMPv4/v6 echo and error messages and
//!   UDP headers, including extraction of the probe embedded in ICMP
//!   error bodies.
//! * [`transport`] — the socket layer: datagram/raw ICMP and UDP
//!   sockets, per-send TTL overrides, deadline receives, the Linux
//!   error queue, and process wide resource caps.
//! * [`backend`] — echo semantics over the transport, one closed set of
//!   implementations behind [`backend::ProbeConnection`].
//! * [`privsep`] — the framed protocol, server and client that confine
//!   raw socket privilege to a small subprocess.
//! * [`ping`] — the periodic prober with its ring-buffer history and
//!   incremental statistics.
//! * [`trace`] — TTL-escalating path discovery.
//! * [`monitor`] — the event channel and query handles a display
//!   consumes.
//!
//! # Example
//!
//! ```no_run
//! use pingtop::backend::BackendKind;
//! use pingtop::monitor::RowKey;
//! use pingtop::ping::{Pinger, PingerConfig};
//! use pingtop::session::Session;
//! use pingtop::transport::IpVersion;
//!
//! # async fn demo() -> Result<(), pingtop::err::ProbeError> {
//! let session = Session::new().await?;
//! let conn = session.open(BackendKind::Icmp, IpVersion::V4).await?;
//! let (events, mut updates) = tokio::sync::mpsc::channel(256);
//! let pinger = Pinger::new(
//!     conn,
//!     "127.0.0.1".parse().unwrap(),
//!     RowKey::target(0),
//!     PingerConfig::default(),
//!     events,
//! );
//! tokio::spawn(async move {
//!     while let Some(update) = updates.recv().await {
//!         println!("{:?}", update);
//!     }
//! });
//! pinger.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod checksum;
pub mod cli;
pub mod err;
pub mod monitor;
pub mod packet;
pub mod ping;
pub mod privsep;
pub mod session;
pub mod trace;
pub mod transport;

pub use err::ProbeError;
