use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use pingtop::backend::{BackendKind, ProbeConnection};
use pingtop::cli::Cli;
use pingtop::err::ProbeError;
use pingtop::monitor::{Monitor, PingUpdate, RowKey};
use pingtop::ping::{Pinger, PingerConfig, ResultKind};
use pingtop::privsep;
use pingtop::session::{Session, SessionConn};
use pingtop::trace::{trace, TraceConfig, TraceStep};
use pingtop::transport::IpVersion;

use clap::Parser;

fn main() -> ExitCode {
    // the sentinel marks the re-executed privileged server; it must
    // win before clap ever sees the arguments
    if std::env::args().nth(1).as_deref() == Some(privsep::SERVER_SENTINEL) {
        return run_privsep_server();
    }

    let cli = Cli::parse();
    if cli.hosts.is_empty() {
        eprintln!("pingtop: no hosts given (try --help)");
        return ExitCode::from(1);
    }
    if let Err(err) = init_logging(&cli) {
        eprintln!("pingtop: {}", err);
        return ExitCode::from(2);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("pingtop: starting runtime: {}", err);
            return ExitCode::from(2);
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pingtop: {}", err);
            ExitCode::from(2)
        }
    }
}

fn run_privsep_server() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(_) => return ExitCode::from(2),
    };
    match runtime.block_on(privsep::server::run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pingtop (privsep server): {}", err);
            ExitCode::from(2)
        }
    }
}

fn init_logging(cli: &Cli) -> Result<(), ProbeError> {
    use tracing_subscriber::EnvFilter;
    match &cli.logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pingtop=debug"));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pingtop=warn"));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Everything the per-target tasks need to spin up more pingers (trace
/// mode discovers hops while running).
#[derive(Clone)]
struct App {
    session: Arc<Session>,
    backend: BackendKind,
    config: PingerConfig,
    events: mpsc::Sender<PingUpdate>,
    monitor: Monitor,
    pingers: Arc<parking_lot::Mutex<Vec<Arc<Pinger<SessionConn>>>>>,
    trace_conns: Arc<parking_lot::Mutex<Vec<Arc<SessionConn>>>>,
    runners: Arc<parking_lot::Mutex<Vec<JoinHandle<Result<(), ProbeError>>>>>,
}

impl App {
    async fn start_pinger(&self, addr: IpAddr, key: RowKey) -> Result<(), ProbeError> {
        let conn = self.session.open(self.backend, IpVersion::of(addr)).await?;
        let pinger = Arc::new(Pinger::new(
            conn,
            addr,
            key,
            self.config.clone(),
            self.events.clone(),
        ));
        self.monitor.register(key, pinger.handle());
        self.pingers.lock().push(pinger.clone());
        let runner = tokio::spawn(async move { pinger.run().await });
        self.runners.lock().push(runner);
        Ok(())
    }

    /// Starts the rows of one target: the direct ping, and in trace
    /// mode a path discovery that adds a row per hop as it appears.
    async fn start_target(&self, group: u16, addr: IpAddr, traced: bool) -> Result<(), ProbeError> {
        self.start_pinger(addr, RowKey::target(group)).await?;
        if !traced {
            return Ok(());
        }
        let trace_conn = Arc::new(
            self.session
                .open(self.backend, IpVersion::of(addr))
                .await?,
        );
        self.trace_conns.lock().push(trace_conn.clone());
        let trace_config = TraceConfig {
            interval: self.config.interval,
            ..TraceConfig::default()
        };
        let app = self.clone();
        let runner = tokio::spawn(async move {
            let (step_tx, mut step_rx) = mpsc::channel::<TraceStep>(64);
            let tracer = trace(&*trace_conn, addr, trace_config, step_tx);
            let consumer = async {
                while let Some(step) = step_rx.recv().await {
                    info!(ttl = step.ttl, peer = %step.peer, "hop discovered");
                    if let Err(err) = app.start_pinger(step.peer, RowKey::hop(group, step.ttl)).await
                    {
                        warn!(%err, peer = %step.peer, "cannot ping hop");
                    }
                }
            };
            let (traced, ()) = tokio::join!(tracer, consumer);
            if let Err(err) = traced {
                warn!(%err, "path discovery ended");
            }
            let _ = trace_conn.close().await;
            Ok(())
        });
        self.runners.lock().push(runner);
        Ok(())
    }

    async fn close_all(&self) {
        let pingers: Vec<_> = self.pingers.lock().drain(..).collect();
        for pinger in pingers {
            let _ = pinger.close().await;
        }
        let trace_conns: Vec<_> = self.trace_conns.lock().drain(..).collect();
        for conn in trace_conns {
            let _ = conn.close().await;
        }
    }

    /// Waits until every runner (including ones added later by trace
    /// discovery) has finished.
    async fn wait_all(&self) {
        loop {
            let batch: Vec<_> = self.runners.lock().drain(..).collect();
            if batch.is_empty() {
                return;
            }
            for runner in batch {
                match runner.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(%err, "probe task failed"),
                    Err(err) => warn!(%err, "probe task panicked"),
                }
            }
        }
    }
}

async fn run(cli: Cli) -> Result<(), ProbeError> {
    let session = Arc::new(Session::new().await?);
    let backend = if cli.udp {
        BackendKind::Udp
    } else {
        BackendKind::Icmp
    };

    let mut targets: Vec<(u16, String, IpAddr)> = Vec::new();
    for (group, host) in cli.hosts.iter().enumerate() {
        let addr = resolve(host, &cli).await?;
        targets.push((group as u16, host.clone(), addr));
    }

    let labels: Arc<HashMap<u16, String>> = Arc::new(
        targets
            .iter()
            .map(|(group, host, addr)| {
                let label = if cli.numeric {
                    addr.to_string()
                } else {
                    host.clone()
                };
                (*group, label)
            })
            .collect(),
    );

    let (events, updates) = mpsc::channel(1024);
    let renderer = tokio::spawn(render_updates(updates, labels));

    let app = App {
        session: session.clone(),
        backend,
        config: PingerConfig {
            interval: cli.probe_interval(),
            count: cli.count,
            ..PingerConfig::default()
        },
        events,
        monitor: Monitor::new(),
        pingers: Arc::new(parking_lot::Mutex::new(Vec::new())),
        trace_conns: Arc::new(parking_lot::Mutex::new(Vec::new())),
        runners: Arc::new(parking_lot::Mutex::new(Vec::new())),
    };

    for (group, _host, addr) in &targets {
        app.start_target(*group, *addr, cli.trace).await?;
    }

    if cli.count.is_some() {
        // bounded run: wait for every target to spend its budget
        tokio::select! {
            _ = app.wait_all() => {}
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .map_err(ProbeError::Io)?;
    }

    app.close_all().await;
    let _ = session.shutdown().await;
    drop(app);
    let _ = renderer.await;
    Ok(())
}

async fn resolve(host: &str, cli: &Cli) -> Result<IpAddr, ProbeError> {
    let mut addrs = tokio::net::lookup_host((host, 0u16)).await?;
    addrs
        .find_map(|addr| {
            let ip = addr.ip();
            let wanted = if cli.ipv4 {
                ip.is_ipv4()
            } else if cli.ipv6 {
                ip.is_ipv6()
            } else {
                true
            };
            wanted.then_some(ip)
        })
        .ok_or_else(|| {
            ProbeError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no usable address for {}", host),
            ))
        })
}

/// Line-oriented fallback display: one line per resolved probe. The
/// interactive table lives outside this crate and consumes the same
/// event stream.
async fn render_updates(
    mut updates: mpsc::Receiver<PingUpdate>,
    labels: Arc<HashMap<u16, String>>,
) {
    while let Some(update) = updates.recv().await {
        // sends are interesting to a table, not to a line printer
        if update.result.kind == ResultKind::Waiting {
            continue;
        }
        let label = labels
            .get(&update.key.group)
            .cloned()
            .unwrap_or_else(|| update.target.to_string());
        let row = if update.key.index == 0 {
            label
        } else {
            format!("{} hop {}", label, update.key.index)
        };
        let latency = match update.result.latency {
            Some(latency) => format!("{:6.1} ms", latency.as_secs_f64() * 1000.0),
            None => "      -  ".to_string(),
        };
        let peer = match update.result.peer {
            Some(peer) => peer.to_string(),
            None => "-".to_string(),
        };
        let avg = match update.stats.avg_latency() {
            Some(avg) => format!("{:.1} ms", avg.as_secs_f64() * 1000.0),
            None => "-".to_string(),
        };
        println!(
            "{:<24} {} seq={:<5} {} from {:<18} avg={} loss={:.0}%",
            row,
            update.result.glyph(),
            update.result.seq,
            latency,
            peer,
            avg,
            update.stats.packet_loss() * 100.0,
        );
    }
}
