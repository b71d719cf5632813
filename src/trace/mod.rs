//! Path discovery by TTL escalation.
//!
//! Probes go out with a growing TTL; each router that kills one reveals
//! itself through a time-exceeded error, and the destination answers
//! the probe that finally reaches it. Repeating the sweep surfaces
//! alternate paths, so steps may arrive out of TTL order and every
//! distinct `(ttl, peer)` pair is emitted exactly once.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::ProbeConnection;
use crate::err::ProbeError;
use crate::packet::{ProbeKind, ProbePacket};

/// Tuning of one traceroute invocation.
#[derive(Clone, Debug)]
pub struct TraceConfig {
    /// Pacing between probes.
    pub interval: Duration,
    /// Full path sweeps to run.
    pub probes_per_hop: u8,
    /// Give up beyond this TTL.
    pub max_ttl: u8,
    /// Per-probe reply deadline.
    pub timeout: Duration,
}

impl Default for TraceConfig {
    fn default() -> TraceConfig {
        TraceConfig {
            interval: Duration::from_secs(1),
            probes_per_hop: 3,
            max_ttl: 64,
            timeout: Duration::from_secs(1),
        }
    }
}

/// One router on the observed path.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TraceStep {
    pub ttl: u8,
    pub peer: IpAddr,
}

/// Traces the path to `dest`, emitting each newly seen step on
/// `steps`. The channel closes when the procedure returns; termination
/// is an error for an unreachable destination, an exhausted TTL range,
/// or a broken connection.
pub async fn trace<C: ProbeConnection>(
    conn: &C,
    dest: IpAddr,
    config: TraceConfig,
    steps: mpsc::Sender<TraceStep>,
) -> Result<(), ProbeError> {
    let mut seen: HashSet<TraceStep> = HashSet::new();
    let mut seq: u16 = 0;
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    for attempt in 0..config.probes_per_hop {
        if attempt > 0 {
            // keep sequence -> destination port unambiguous across
            // sweeps on port-based backends
            conn.advance_base_port(u16::from(config.max_ttl));
        }
        let mut reached = false;
        for ttl in 1..=config.max_ttl {
            ticker.tick().await;
            seq = seq.wrapping_add(1);
            let packet = ProbePacket::request(seq, b"");
            conn.send(&packet, dest, Some(ttl)).await?;
            match recv_matching(conn, seq, config.timeout).await {
                Ok((reply, peer)) => match reply.kind {
                    ProbeKind::TimeExceeded => {
                        emit(&steps, &mut seen, TraceStep { ttl, peer }).await;
                    }
                    ProbeKind::EchoReply => {
                        emit(&steps, &mut seen, TraceStep { ttl, peer }).await;
                        reached = true;
                        break;
                    }
                    ProbeKind::DestinationUnreachable => {
                        return Err(ProbeError::Unreachable(peer));
                    }
                    // never surfaced by the backends
                    ProbeKind::EchoRequest => unreachable!("backends filter echo requests"),
                },
                // a silent hop; move on to the next TTL
                Err(err) if err.is_timeout() => {
                    debug!(ttl, "no answer within the hop deadline");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        if !reached {
            return Err(ProbeError::MaxTtlReached(config.max_ttl));
        }
    }
    Ok(())
}

/// Waits for the reply to the probe just sent, skipping replies to
/// older sequences.
async fn recv_matching<C: ProbeConnection>(
    conn: &C,
    seq: u16,
    timeout: Duration,
) -> Result<(ProbePacket, IpAddr), ProbeError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout);
        }
        let (reply, peer) = conn.recv(remaining).await?;
        if reply.seq == seq {
            return Ok((reply, peer));
        }
        debug!(
            got = reply.seq,
            expected = seq,
            "skipping reply for an older probe"
        );
    }
}

async fn emit(
    steps: &mpsc::Sender<TraceStep>,
    seen: &mut HashSet<TraceStep>,
    step: TraceStep,
) {
    if seen.insert(step) {
        // the consumer may have stopped listening; tracing continues
        // regardless, the dedup set still grows
        let _ = steps.send(step).await;
    }
}
