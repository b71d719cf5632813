use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::backend::ProbeConnection;
use crate::err::ProbeError;
use crate::monitor::{PingUpdate, RowKey};
use crate::packet::{ProbeKind, ProbePacket};

use super::{History, PingResult, ResultKind, Stats, DEFAULT_HISTORY};

/// Tuning of one pinger.
#[derive(Clone, Debug)]
pub struct PingerConfig {
    /// Time between probes. The CLI enforces the one second floor, the
    /// transport's rate limiter backs it up.
    pub interval: Duration,
    /// How long a probe may stay unanswered before it counts as
    /// dropped.
    pub timeout: Duration,
    /// Ring capacity.
    pub history: usize,
    /// Probe budget; `None` keeps probing until closed.
    pub count: Option<u64>,
    /// Probe payload (empty by default).
    pub payload: Vec<u8>,
}

impl Default for PingerConfig {
    fn default() -> PingerConfig {
        PingerConfig {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            history: DEFAULT_HISTORY,
            count: None,
            payload: Vec::new(),
        }
    }
}

/// How long one receive poll blocks; bounds shutdown latency only.
const RECV_POLL: Duration = Duration::from_secs(1);

struct State {
    history: History,
    stats: Stats,
}

/// Periodic prober for one target.
///
/// Created idle; [`Pinger::run`] drives three cooperating loops (send,
/// receive, timeout) over the shared state until the probe budget is
/// exhausted, a fatal error occurs, or [`Pinger::close`] is called.
pub struct Pinger<C> {
    conn: Arc<C>,
    target: IpAddr,
    key: RowKey,
    config: PingerConfig,
    state: Arc<Mutex<State>>,
    events: mpsc::Sender<PingUpdate>,
    shutdown: watch::Sender<bool>,
}

/// Query surface of a running pinger, safe to use concurrently with
/// probing. Snapshots are consistent at the instant of the call.
#[derive(Clone)]
pub struct PingerHandle {
    target: IpAddr,
    state: Arc<Mutex<State>>,
}

impl PingerHandle {
    pub fn target(&self) -> IpAddr {
        self.target
    }

    /// Outcome of the most recent probe.
    pub fn latest(&self) -> Option<PingResult> {
        self.state.lock().history.latest().copied()
    }

    /// History snapshot, newest first.
    pub fn history(&self) -> Vec<PingResult> {
        self.state
            .lock()
            .history
            .iter_newest_first()
            .copied()
            .collect()
    }

    pub fn stats(&self) -> Stats {
        self.state.lock().stats
    }
}

impl<C: ProbeConnection> Pinger<C> {
    pub fn new(
        conn: C,
        target: IpAddr,
        key: RowKey,
        config: PingerConfig,
        events: mpsc::Sender<PingUpdate>,
    ) -> Pinger<C> {
        let state = Arc::new(Mutex::new(State {
            history: History::new(config.history),
            stats: Stats::new(),
        }));
        let (shutdown, _) = watch::channel(false);
        Pinger {
            conn: Arc::new(conn),
            target,
            key,
            config,
            state,
            events,
            shutdown,
        }
    }

    pub fn handle(&self) -> PingerHandle {
        PingerHandle {
            target: self.target,
            state: self.state.clone(),
        }
    }

    pub fn key(&self) -> RowKey {
        self.key
    }

    /// Runs until the probe budget is exhausted (draining outstanding
    /// timeouts first), a fatal connection error occurs, or
    /// [`Pinger::close`] is called.
    pub async fn run(&self) -> Result<(), ProbeError> {
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }
        tokio::select! {
            result = self.drive_probes(timeout_tx, timeout_rx) => result,
            result = self.recv_loop() => result,
            _ = shutdown.changed() => Ok(()),
        }
    }

    /// Signals the loops to stop and closes the connection, unblocking
    /// a receive in flight.
    pub async fn close(&self) -> Result<(), ProbeError> {
        let _ = self.shutdown.send(true);
        self.conn.close().await
    }

    /// Send loop and timeout loop; both must finish for a natural
    /// termination (budget spent and every timeout resolved).
    async fn drive_probes(
        &self,
        timeout_tx: mpsc::UnboundedSender<(u16, Instant)>,
        timeout_rx: mpsc::UnboundedReceiver<(u16, Instant)>,
    ) -> Result<(), ProbeError> {
        let (sent, timed_out) = tokio::join!(
            self.send_loop(timeout_tx),
            self.timeout_loop(timeout_rx),
        );
        sent.and(timed_out)
    }

    async fn send_loop(
        &self,
        timeout_tx: mpsc::UnboundedSender<(u16, Instant)>,
    ) -> Result<(), ProbeError> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sent: u64 = 0;
        loop {
            if let Some(budget) = self.config.count {
                if sent >= budget {
                    // dropping the sender lets the timeout loop drain
                    // and finish
                    return Ok(());
                }
            }
            ticker.tick().await;
            let (seq, sent_at, update) = {
                let mut state = self.state.lock();
                let sent_at = Instant::now();
                let seq = state.history.record_sent(sent_at);
                let result = PingResult::waiting(seq, sent_at);
                (seq, sent_at, self.update(result, state.stats))
            };
            self.emit(update).await;
            let packet = ProbePacket::request(seq, &self.config.payload);
            self.conn.send(&packet, self.target, None).await?;
            let _ = timeout_tx.send((seq, sent_at + self.config.timeout));
            sent += 1;
        }
    }

    async fn timeout_loop(
        &self,
        mut timeout_rx: mpsc::UnboundedReceiver<(u16, Instant)>,
    ) -> Result<(), ProbeError> {
        while let Some((seq, deadline)) = timeout_rx.recv().await {
            tokio::time::sleep_until(deadline).await;
            let update = {
                let mut state = self.state.lock();
                let State { history, stats } = &mut *state;
                match history.slot_mut(seq) {
                    // only a still-waiting slot becomes a drop; the
                    // receive loop may have won the race under this
                    // same mutex
                    Some(slot) if slot.kind == ResultKind::Waiting => {
                        slot.kind = ResultKind::Dropped;
                        stats.record_failure();
                        self.update(*slot, *stats)
                    }
                    _ => None,
                }
            };
            if let Some(update) = update {
                self.emit(Some(update)).await;
            }
        }
        Ok(())
    }

    async fn recv_loop(&self) -> Result<(), ProbeError> {
        loop {
            match self.conn.recv(RECV_POLL).await {
                Ok((packet, peer)) => {
                    let update = self.handle_reply(packet, peer);
                    self.emit(update).await;
                }
                Err(err) if err.is_timeout() => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Classifies one reply against its slot. Runs entirely under the
    /// state mutex; a racing timeout observes either the old or the new
    /// kind, never half of each.
    fn handle_reply(&self, packet: ProbePacket, peer: IpAddr) -> Option<PingUpdate> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let State { history, stats } = &mut *state;
        let Some(slot) = history.slot_mut(packet.seq) else {
            // overwritten by newer probes or never sent
            debug!(seq = packet.seq, %peer, "late or unknown reply");
            return None;
        };
        match slot.kind {
            ResultKind::Waiting | ResultKind::Dropped => {
                let latency = now.saturating_duration_since(slot.sent_at);
                slot.kind = match packet.kind {
                    ProbeKind::EchoReply => ResultKind::Success,
                    ProbeKind::TimeExceeded => ResultKind::TtlExceeded,
                    ProbeKind::DestinationUnreachable => ResultKind::Unreachable,
                    // requests are filtered out by the backends
                    ProbeKind::EchoRequest => return None,
                };
                slot.latency = Some(latency);
                slot.peer = Some(peer);
                match slot.kind {
                    ResultKind::Success => stats.record_success(latency),
                    _ => stats.record_failure(),
                }
                self.update(*slot, *stats)
            }
            ResultKind::Success | ResultKind::TtlExceeded | ResultKind::Unreachable => {
                // a second reply poisons the probe: it no longer counts
                // as a clean success
                if slot.kind == ResultKind::Success {
                    if let Some(latency) = slot.latency {
                        stats.retract_success(latency);
                        stats.record_failure();
                    }
                }
                slot.kind = ResultKind::Duplicate;
                self.update(*slot, *stats)
            }
            ResultKind::Duplicate => self.update(*slot, *stats),
        }
    }

    fn update(&self, result: PingResult, stats: Stats) -> Option<PingUpdate> {
        Some(PingUpdate {
            key: self.key,
            target: self.target,
            result,
            stats,
        })
    }

    async fn emit(&self, update: Option<PingUpdate>) {
        if let Some(update) = update {
            // a gone display is not an error worth stopping probes for
            let _ = self.events.send(update).await;
        }
    }
}
