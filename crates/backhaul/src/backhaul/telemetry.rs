use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// Number of recent connection events kept for inspection.
pub const HISTORY_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Public,
    Control,
    Tunnel,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Public => "public",
            ConnectionKind::Control => "control",
            ConnectionKind::Tunnel => "tunnel",
        }
    }
}

/// Error categories tallied by [`Statistics::record_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    ConnectTimeout,
    ConnectRefused,
    TransportReset,
    BrokenPipe,
    HandshakeTimeout,
    MalformedMessage,
    UnknownClient,
    RateLimitExceeded,
    TunnelWaitTimeout,
    PortBindConflict,
    IdleTimeout,
    NoClients,
    ClientGone,
    PingFailure,
    DeadClient,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectTimeout => "connect_timeout",
            ErrorKind::ConnectRefused => "connect_refused",
            ErrorKind::TransportReset => "transport_reset",
            ErrorKind::BrokenPipe => "broken_pipe",
            ErrorKind::HandshakeTimeout => "handshake_timeout",
            ErrorKind::MalformedMessage => "malformed_message",
            ErrorKind::UnknownClient => "unknown_client",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::TunnelWaitTimeout => "tunnel_wait_timeout",
            ErrorKind::PortBindConflict => "port_bind_conflict",
            ErrorKind::IdleTimeout => "idle_timeout",
            ErrorKind::NoClients => "no_clients",
            ErrorKind::ClientGone => "client_gone",
            ErrorKind::PingFailure => "ping_failure",
            ErrorKind::DeadClient => "dead_client",
            ErrorKind::Io => "io",
        }
    }

    /// Maps an I/O failure onto the closest statistics bucket.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::ConnectionRefused => ErrorKind::ConnectRefused,
            Io::ConnectionReset | Io::ConnectionAborted => ErrorKind::TransportReset,
            Io::BrokenPipe => ErrorKind::BrokenPipe,
            Io::TimedOut => ErrorKind::ConnectTimeout,
            Io::AddrInUse => ErrorKind::PortBindConflict,
            Io::InvalidData => ErrorKind::MalformedMessage,
            _ => ErrorKind::Io,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub kind: ConnectionKind,
    pub at_unix_ms: u64,
}

/// Rendered view of the counters. This is also the `data` payload of a `STATS` reply, so it
/// has to deserialize on the client side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub uptime: String,
    pub total_connections: u64,
    pub active_connections: u64,
    pub peak_connections: u64,
    pub total_tunnels: u64,
    pub total_clients: u64,
    pub bytes_sent: String,
    pub bytes_received: String,
    pub total_errors: u64,
    pub connections_per_hour: String,
    #[serde(default)]
    pub errors: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct Gauges {
    active: u64,
    peak: u64,
    errors: BTreeMap<ErrorKind, u64>,
    history: VecDeque<ConnectionEvent>,
}

/// Process-wide usage counters. Updates never block the data path for longer than a short
/// mutex section.
#[derive(Debug)]
pub struct Statistics {
    started: Instant,
    total_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    tunnels: AtomicU64,
    clients: AtomicU64,
    gauges: Mutex<Gauges>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_connections: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            tunnels: AtomicU64::new(0),
            clients: AtomicU64::new(0),
            gauges: Mutex::new(Gauges::default()),
        }
    }

    fn gauges(&self) -> MutexGuard<'_, Gauges> {
        self.gauges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_connection(&self, kind: ConnectionKind) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        {
            let mut g = self.gauges();
            g.active += 1;
            g.peak = g.peak.max(g.active);
            g.history.push_back(ConnectionEvent {
                kind,
                at_unix_ms: now_unix_ms(),
            });
            while g.history.len() > HISTORY_LEN {
                g.history.pop_front();
            }
        }
        metrics::counter!("backhaul_connections_total", "kind" => kind.as_str()).increment(1);
        metrics::gauge!("backhaul_active_connections").increment(1.0);
    }

    pub fn record_disconnection(&self) {
        let mut g = self.gauges();
        if g.active > 0 {
            g.active -= 1;
            metrics::gauge!("backhaul_active_connections").decrement(1.0);
        }
    }

    /// Returns a guard that records the connection now and its disconnection on drop.
    pub fn active_connection(self: &Arc<Self>, kind: ConnectionKind) -> ActiveConnection {
        self.record_connection(kind);
        ActiveConnection {
            stats: self.clone(),
        }
    }

    pub fn record_bytes(&self, sent: u64, received: u64) {
        if sent > 0 {
            self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
            metrics::counter!("backhaul_bytes_sent_total").increment(sent);
        }
        if received > 0 {
            self.bytes_received.fetch_add(received, Ordering::Relaxed);
            metrics::counter!("backhaul_bytes_received_total").increment(received);
        }
    }

    pub fn record_tunnel(&self) {
        self.tunnels.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("backhaul_tunnels_total").increment(1);
    }

    pub fn record_client(&self) {
        self.clients.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("backhaul_clients_total").increment(1);
    }

    pub fn record_error(&self, kind: ErrorKind) {
        *self.gauges().errors.entry(kind).or_insert(0) += 1;
        metrics::counter!("backhaul_errors_total", "kind" => kind.as_str()).increment(1);
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn tunnels_created(&self) -> u64 {
        self.tunnels.load(Ordering::Relaxed)
    }

    pub fn clients_registered(&self) -> u64 {
        self.clients.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.gauges().active
    }

    /// Raw `(sent, received)` byte totals.
    pub fn bytes(&self) -> (u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }

    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.gauges().errors.get(&kind).copied().unwrap_or(0)
    }

    pub fn recent_connections(&self) -> Vec<ConnectionEvent> {
        self.gauges().history.iter().cloned().collect()
    }

    pub fn summary(&self) -> StatsSummary {
        let uptime = self.uptime();
        let hours = (uptime.as_secs_f64() / 3600.0).max(0.01);
        let total = self.total_connections();
        let (sent, received) = self.bytes();

        let g = self.gauges();
        let errors: BTreeMap<String, u64> = g
            .errors
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), *v))
            .collect();

        StatsSummary {
            uptime: humantime::format_duration(Duration::from_secs(uptime.as_secs())).to_string(),
            total_connections: total,
            active_connections: g.active,
            peak_connections: g.peak,
            total_tunnels: self.tunnels_created(),
            total_clients: self.clients_registered(),
            bytes_sent: format_bytes(sent),
            bytes_received: format_bytes(received),
            total_errors: errors.values().sum(),
            connections_per_hour: format!("{:.1}", total as f64 / hours),
            errors,
        }
    }

    pub fn log_summary(&self, label: &str) {
        let s = self.summary();
        tracing::info!(
            uptime = %s.uptime,
            total_connections = s.total_connections,
            active_connections = s.active_connections,
            peak_connections = s.peak_connections,
            connections_per_hour = %s.connections_per_hour,
            tunnels = s.total_tunnels,
            clients = s.total_clients,
            bytes_sent = %s.bytes_sent,
            bytes_received = %s.bytes_received,
            errors = s.total_errors,
            "stats: {label}"
        );
    }
}

/// Keeps one connection counted as active until dropped.
#[derive(Debug)]
pub struct ActiveConnection {
    stats: Arc<Statistics>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.record_disconnection();
    }
}

pub fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    for unit in UNITS {
        if v < 1024.0 {
            return format!("{v:.2} {unit}");
        }
        v /= 1024.0;
    }
    format!("{v:.2} PB")
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub type SharedStatistics = Arc<Statistics>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
