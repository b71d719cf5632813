use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Floor for the probe interval; also backed by the transport's rate
/// limiter.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Live ping/traceroute monitor for many hosts.
#[derive(Debug, Parser)]
#[command(name = "pingtop", version, about, disable_help_subcommand = true)]
pub struct Cli {
    /// Hosts to probe.
    #[arg(value_name = "HOST")]
    pub hosts: Vec<String>,

    /// Trace the path to each host and ping every hop.
    #[arg(short = 't', long)]
    pub trace: bool,

    /// Seconds between probes to one target (minimum 1).
    #[arg(short = 'i', long, value_name = "SECS", default_value_t = 1.0)]
    pub interval: f64,

    /// Show addresses instead of resolved names.
    #[arg(short = 'n', long)]
    pub numeric: bool,

    /// Append diagnostic logs to this file.
    #[arg(long, value_name = "PATH")]
    pub logfile: Option<PathBuf>,

    /// Probe with UDP datagrams instead of ICMP echo.
    #[arg(short = 'u', long)]
    pub udp: bool,

    /// Only consider IPv4 addresses when resolving.
    #[arg(short = '4', conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Only consider IPv6 addresses when resolving.
    #[arg(short = '6')]
    pub ipv6: bool,

    /// Stop after this many probes per target.
    #[arg(short = 'c', long, value_name = "N")]
    pub count: Option<u64>,
}

impl Cli {
    /// The probe interval, clamped to the enforced minimum.
    pub fn probe_interval(&self) -> Duration {
        let requested = Duration::from_secs_f64(self.interval.max(0.0));
        requested.max(MIN_INTERVAL)
    }
}
