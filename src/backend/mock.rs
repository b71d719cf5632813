//! Scripted in-memory connection for pinger and traceroute tests.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::err::ProbeError;
use crate::packet::ProbePacket;

use super::ProbeConnection;

/// Replies (with artificial delays) a scripted send should produce.
pub(crate) type Replies = Vec<(Duration, ProbePacket, IpAddr)>;

/// Script invoked per send: receives the outbound packet, the TTL
/// override and the zero-based send index.
pub(crate) type SendScript = Box<dyn Fn(&ProbePacket, Option<u8>, u32) -> Replies + Send + Sync>;

pub(crate) struct MockConn {
    on_send: SendScript,
    tx: mpsc::UnboundedSender<(ProbePacket, IpAddr)>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(ProbePacket, IpAddr)>>,
    sends: AtomicU32,
    closed: AtomicBool,
    sent: Mutex<Vec<(ProbePacket, Option<u8>)>>,
}

impl MockConn {
    pub(crate) fn new(on_send: SendScript) -> MockConn {
        let (tx, rx) = mpsc::unbounded_channel();
        MockConn {
            on_send,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            sends: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn sent(&self) -> Vec<(ProbePacket, Option<u8>)> {
        self.sent.lock().clone()
    }
}

impl ProbeConnection for MockConn {
    async fn send(
        &self,
        packet: &ProbePacket,
        _dest: IpAddr,
        ttl: Option<u8>,
    ) -> Result<(), ProbeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProbeError::Closed);
        }
        self.sent.lock().push((packet.clone(), ttl));
        let nth = self.sends.fetch_add(1, Ordering::AcqRel);
        for (delay, reply, peer) in (self.on_send)(packet, ttl, nth) {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send((reply, peer));
            });
        }
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<(ProbePacket, IpAddr), ProbeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProbeError::Closed);
        }
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_elapsed) => Err(ProbeError::Timeout),
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(ProbeError::Closed),
        }
    }

    async fn close(&self) -> Result<(), ProbeError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
