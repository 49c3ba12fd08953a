use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
    time::{self, MissedTickBehavior},
};

use crate::backhaul::{
    net,
    telemetry::{ConnectionKind, ErrorKind, SharedStatistics, Statistics},
    tunnel::{
        control, forward::ForwardOptions, manager::Manager, monitor, protocol, public,
        ratelimit::{RateLimiter, RateLimits},
        registry::TunnelQueueEntry,
    },
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_host: String,
    pub public_port: u16,
    pub control_port: u16,
    pub tunnel_port: u16,
    pub limits: RateLimits,
    /// Zero disables the periodic summary.
    pub stats_interval: Duration,
    pub handshake_timeout: Duration,
    pub control_idle_timeout: Duration,
    pub max_ping_failures: u32,
    pub tunnel_registration_timeout: Duration,
    pub tunnel_wait_timeout: Duration,
    pub unclaimed_tunnel_ttl: Duration,
    pub monitor_interval: Duration,
    pub write_timeout: Duration,
    /// How long in-flight connections get to finish after shutdown before they are aborted.
    pub drain_timeout: Duration,
    pub forward: ForwardOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            public_port: 8080,
            control_port: 8081,
            tunnel_port: 8082,
            limits: RateLimits::default(),
            stats_interval: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            control_idle_timeout: Duration::from_secs(60),
            max_ping_failures: 3,
            tunnel_registration_timeout: Duration::from_secs(5),
            tunnel_wait_timeout: Duration::from_secs(10),
            unclaimed_tunnel_ttl: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(2),
            forward: ForwardOptions::default(),
        }
    }
}

/// State shared by every connection task of one relay.
#[derive(Debug)]
pub struct RelayContext {
    pub opts: ServerOptions,
    pub manager: Manager,
    pub limiter: RateLimiter,
    pub stats: SharedStatistics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddrs {
    pub public: SocketAddr,
    pub control: SocketAddr,
    pub tunnel: SocketAddr,
}

pub struct RelayServer {
    ctx: Arc<RelayContext>,
    public: TcpListener,
    control: TcpListener,
    tunnel: TcpListener,
    addrs: BoundAddrs,
}

impl RelayServer {
    /// Binds all three listeners up front. Any bind failure aborts startup.
    pub async fn bind(opts: ServerOptions, stats: SharedStatistics) -> anyhow::Result<Self> {
        let public = bind_listener(&stats, "public", &opts.bind_host, opts.public_port).await?;
        let control = bind_listener(&stats, "control", &opts.bind_host, opts.control_port).await?;
        let tunnel = bind_listener(&stats, "tunnel", &opts.bind_host, opts.tunnel_port).await?;

        let addrs = BoundAddrs {
            public: public.local_addr()?,
            control: control.local_addr()?,
            tunnel: tunnel.local_addr()?,
        };

        let ctx = Arc::new(RelayContext {
            manager: Manager::new(opts.unclaimed_tunnel_ttl),
            limiter: RateLimiter::new(opts.limits),
            stats,
            opts,
        });

        Ok(Self {
            ctx,
            public,
            control,
            tunnel,
            addrs,
        })
    }

    pub fn context(&self) -> Arc<RelayContext> {
        self.ctx.clone()
    }

    pub fn addrs(&self) -> BoundAddrs {
        self.addrs
    }

    pub async fn serve(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let ctx = self.ctx;
        let limits = ctx.limiter.limits();
        tracing::info!(
            public = %self.addrs.public,
            control = %self.addrs.control,
            tunnel = %self.addrs.tunnel,
            max_connections_per_client = limits.max_connections_per_client,
            max_tunnels_per_minute = limits.max_tunnels_per_minute,
            "server: relay started"
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(accept_loop(
            "public",
            self.public,
            ctx.clone(),
            shutdown.clone(),
            public::handle_public,
        ));
        tasks.spawn(accept_loop(
            "control",
            self.control,
            ctx.clone(),
            shutdown.clone(),
            control::handle_control,
        ));
        tasks.spawn(accept_loop(
            "tunnel",
            self.tunnel,
            ctx.clone(),
            shutdown.clone(),
            handle_tunnel,
        ));
        tasks.spawn(monitor::run_monitor(ctx.clone(), shutdown.clone()));
        tasks.spawn(stats_loop(ctx.clone(), shutdown.clone()));

        let mut sd = shutdown;
        while !*sd.borrow() {
            if sd.changed().await.is_err() {
                break;
            }
        }

        tracing::info!("server: shutting down");
        notify_shutdown(&ctx).await;

        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                tracing::warn!(err = %err, "server: task ended abnormally");
            }
        }

        ctx.stats.log_summary("final");
        Ok(())
    }
}

async fn bind_listener(
    stats: &Statistics,
    name: &str,
    host: &str,
    port: u16,
) -> anyhow::Result<TcpListener> {
    let addr = net::join_host_port(host, port);
    match TcpListener::bind(addr.as_str()).await {
        Ok(ln) => {
            tracing::info!(listener = name, addr = %ln.local_addr()?, "server: listening");
            Ok(ln)
        }
        Err(err) => {
            stats.record_error(ErrorKind::PortBindConflict);
            Err(err).with_context(|| format!("bind {name} listener on {addr}"))
        }
    }
}

async fn accept_loop<F, Fut>(
    name: &'static str,
    ln: TcpListener,
    ctx: Arc<RelayContext>,
    mut shutdown: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn(Arc<RelayContext>, TcpStream, SocketAddr) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut conns = JoinSet::new();

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(res) = conns.join_next(), if !conns.is_empty() => {
                if let Err(err) = res {
                    if err.is_panic() {
                        tracing::error!(listener = name, err = %err, "server: connection task panicked");
                    }
                }
            }
            accepted = ln.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::debug!(listener = name, remote = %remote, "server: accepted");
                    conns.spawn(handler(ctx.clone(), stream, remote));
                }
                Err(err) => {
                    tracing::warn!(listener = name, err = %err, "server: accept failed");
                    ctx.stats.record_error(ErrorKind::from_io(&err));
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    drop(ln);
    tracing::info!(listener = name, in_flight = conns.len(), "server: listener closed");

    let drain = async {
        while conns.join_next().await.is_some() {}
    };
    if time::timeout(ctx.opts.drain_timeout, drain).await.is_err() {
        tracing::warn!(listener = name, remaining = conns.len(), "server: aborting in-flight connections");
        conns.abort_all();
        while conns.join_next().await.is_some() {}
    }
}

/// Reads the registration line of a tunnel connection and queues it for its client.
pub async fn handle_tunnel(ctx: Arc<RelayContext>, mut stream: TcpStream, remote: SocketAddr) {
    let active = ctx.stats.active_connection(ConnectionKind::Tunnel);
    let _ = stream.set_nodelay(true);

    let read = protocol::read_tunnel_registration(&mut stream);
    let reg = match time::timeout(ctx.opts.tunnel_registration_timeout, read).await {
        Err(_) => {
            tracing::warn!(remote = %remote, "tunnel: registration timeout");
            ctx.stats.record_error(ErrorKind::HandshakeTimeout);
            return;
        }
        Ok(Err(err)) => {
            tracing::warn!(remote = %remote, err = %err, "tunnel: invalid registration");
            ctx.stats.record_error(ErrorKind::MalformedMessage);
            return;
        }
        Ok(Ok(reg)) => reg,
    };

    let Some(queue) = ctx.manager.tunnel_queue(&reg.client_id).await else {
        tracing::warn!(remote = %remote, cid = %reg.client_id, "tunnel: unknown client");
        ctx.stats.record_error(ErrorKind::UnknownClient);
        return;
    };

    let entry = TunnelQueueEntry::new(stream, remote.to_string()).with_guard(active);
    if queue.push(entry).await.is_err() {
        tracing::warn!(remote = %remote, cid = %reg.client_id, "tunnel: client went away");
        ctx.stats.record_error(ErrorKind::UnknownClient);
        return;
    }

    ctx.stats.record_tunnel();
    tracing::info!(remote = %remote, cid = %reg.client_id, "tunnel: queued");
}

/// Best-effort shutdown notice to every client. Dropping the drained outboxes afterwards
/// makes each control handler close its transport.
async fn notify_shutdown(ctx: &RelayContext) {
    let drained = ctx.manager.drain_for_shutdown().await;
    for (cid, outbox) in drained {
        let sent = time::timeout(
            Duration::from_secs(1),
            outbox.send(protocol::ServerMessage::Shutdown),
        )
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            tracing::debug!(cid = %cid, "server: could not queue shutdown notice");
        }
        ctx.limiter.forget(&cid);
    }
}

async fn stats_loop(ctx: Arc<RelayContext>, mut shutdown: watch::Receiver<bool>) {
    let every = ctx.opts.stats_interval;
    if every.is_zero() {
        return;
    }

    let mut tick = time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await;

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                ctx.stats.log_summary("periodic");
                let clients = ctx.manager.client_count().await;
                tracing::info!(clients, "stats: registered clients");
            }
        }
    }
}
