use std::{io, sync::Arc, time::Duration};

use anyhow::Context;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::{
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::watch,
    task::JoinSet,
    time::{self, Instant},
};
use tokio_util::codec::FramedRead;

use crate::backhaul::{
    net,
    telemetry::{ConnectionKind, ErrorKind, SharedStatistics, Statistics, now_unix_ms},
    tunnel::{
        backoff::{Backoff, BackoffPolicy},
        forward::{self, ForwardOptions, PumpReport},
        protocol::{
            self, CLIENT_HELLO, ClientMessage, ProtocolError, ServerMessage, TunnelRegistration,
        },
    },
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_host: String,
    pub control_port: u16,
    pub tunnel_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub connect_timeout: Duration,
    pub local_connect_timeout: Duration,
    /// How long the control loop waits for a server message before logging the silence.
    pub read_timeout: Duration,
    pub handshake_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub shutdown_grace: Duration,
    pub request_stats: bool,
    pub forward: ForwardOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_host: "localhost".into(),
            control_port: 8081,
            tunnel_port: 8082,
            local_host: "127.0.0.1".into(),
            local_port: 5555,
            connect_timeout: Duration::from_secs(10),
            local_connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            shutdown_grace: Duration::from_secs(1),
            request_stats: false,
            forward: ForwardOptions::default(),
        }
    }
}

impl ClientOptions {
    pub fn control_addr(&self) -> String {
        net::join_host_port(&self.server_host, self.control_port)
    }

    pub fn tunnel_addr(&self) -> String {
        net::join_host_port(&self.server_host, self.tunnel_port)
    }

    pub fn local_addr(&self) -> String {
        net::join_host_port(&self.local_host, self.local_port)
    }
}

/// Why a single tunnel spawn gave up. Never fatal to the control loop.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("server unreachable at {addr}: {source}")]
    ServerUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("local service unreachable at {addr}: {source}")]
    LocalUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("tunnel registration failed: {0}")]
    Register(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(ProtocolError),
    #[error("server closed the control channel")]
    Closed,
    #[error("control channel: {0}")]
    Protocol(#[from] ProtocolError),
}

/// How a control session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    ServerShutdown,
    LocalShutdown,
}

pub struct Client {
    opts: Arc<ClientOptions>,
    stats: SharedStatistics,
}

impl Client {
    pub fn new(opts: ClientOptions, stats: SharedStatistics) -> Self {
        Self {
            opts: Arc::new(opts),
            stats,
        }
    }

    /// Bare connect-and-close against the local service.
    pub async fn probe_local(&self) -> Result<(), SpawnError> {
        let addr = self.opts.local_addr();
        match connect(&addr, self.opts.local_connect_timeout).await {
            Ok(_) => Ok(()),
            Err(source) => Err(SpawnError::LocalUnreachable { addr, source }),
        }
    }

    /// Runs the control loop until `shutdown` flips. Refuses to start when the local service
    /// is down.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.probe_local()
            .await
            .context("local service check failed; start the local service first")?;

        tracing::info!(
            server = %self.opts.control_addr(),
            tunnel = %self.opts.tunnel_addr(),
            local = %self.opts.local_addr(),
            "client: starting"
        );

        let mut backoff = Backoff::new(self.opts.backoff);
        let mut tunnels = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_session(&mut backoff, &mut tunnels, shutdown.clone()).await {
                Ok(SessionEnd::LocalShutdown) => break,
                Ok(SessionEnd::ServerShutdown) => {
                    tracing::warn!("client: server is shutting down");
                }
                Err(err) => {
                    tracing::warn!(err = %err, "client: control session ended");
                }
            }

            while tunnels.try_join_next().is_some() {}

            if *shutdown.borrow() {
                break;
            }

            let delay = backoff.next_delay();
            tracing::info!(
                attempt = backoff.attempts(),
                retry_in = %humantime::format_duration(delay),
                "client: reconnecting"
            );

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = time::sleep(delay) => {}
            }
        }

        tracing::info!(in_flight = tunnels.len(), "client: shutting down");
        if !tunnels.is_empty() {
            time::sleep(self.opts.shutdown_grace).await;
        }
        tunnels.abort_all();
        while tunnels.join_next().await.is_some() {}

        self.stats.log_summary("client final");
        Ok(())
    }

    async fn run_session(
        &self,
        backoff: &mut Backoff,
        tunnels: &mut JoinSet<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionEnd, ClientError> {
        let addr = self.opts.control_addr();
        let stream = connect(&addr, self.opts.connect_timeout).await.map_err(|source| {
            self.stats.record_error(ErrorKind::from_io(&source));
            ClientError::Connect {
                addr: addr.clone(),
                source,
            }
        })?;
        backoff.reset();
        let _ = stream.set_nodelay(true);

        let (rd, mut wr) = stream.into_split();
        let mut lines = FramedRead::new(rd, protocol::control_codec());

        protocol::write_line(&mut wr, CLIENT_HELLO)
            .await
            .map_err(ClientError::Handshake)?;

        let ack = match time::timeout(self.opts.handshake_timeout, lines.next()).await {
            Err(_) => {
                self.stats.record_error(ErrorKind::HandshakeTimeout);
                return Err(ClientError::Handshake(ProtocolError::Io(
                    io::ErrorKind::TimedOut.into(),
                )));
            }
            Ok(None) => return Err(ClientError::Closed),
            Ok(Some(Err(err))) => return Err(ClientError::Handshake(err.into())),
            Ok(Some(Ok(line))) => match ServerMessage::decode(&line) {
                Ok(ServerMessage::Ack(ack)) => ack,
                Ok(other) => {
                    self.stats.record_error(ErrorKind::MalformedMessage);
                    return Err(ClientError::Handshake(ProtocolError::Unexpected(format!(
                        "{other:?}"
                    ))));
                }
                Err(err) => {
                    self.stats.record_error(ErrorKind::MalformedMessage);
                    return Err(ClientError::Handshake(err));
                }
            },
        };

        let cid: Arc<str> = Arc::from(ack.client_id.as_str());
        tracing::info!(
            cid = %cid,
            server_version = %ack.server_version,
            features = ?ack.features,
            message = %ack.message,
            "client: registered"
        );

        // Servers that never send TUNNEL_REQUEST still get one ready tunnel.
        self.spawn_tunnel(tunnels, cid.clone());

        if self.opts.request_stats {
            self.send(&mut wr, &ClientMessage::StatsRequest).await?;
        }

        let read_timeout = self.opts.read_timeout;
        let quiet = time::sleep(read_timeout);
        tokio::pin!(quiet);

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(SessionEnd::LocalShutdown);
                    }
                }
                Some(res) = tunnels.join_next(), if !tunnels.is_empty() => {
                    if let Err(err) = res {
                        if err.is_panic() {
                            tracing::error!(err = %err, "client: tunnel task panicked");
                        }
                    }
                }
                _ = &mut quiet => {
                    tracing::debug!(cid = %cid, "client: no message from server");
                    quiet.as_mut().reset(Instant::now() + read_timeout);
                }
                line = lines.next() => {
                    let line = match line {
                        None => return Err(ClientError::Closed),
                        Some(Err(err)) => {
                            self.stats.record_error(ErrorKind::MalformedMessage);
                            return Err(ClientError::Protocol(err.into()));
                        }
                        Some(Ok(line)) => line,
                    };
                    quiet.as_mut().reset(Instant::now() + read_timeout);

                    match ServerMessage::decode(&line) {
                        Ok(ServerMessage::Ping) => {
                            tracing::debug!(cid = %cid, "client: ping");
                            self.send(&mut wr, &ClientMessage::Pong).await?;
                        }
                        Ok(ServerMessage::TunnelRequest) => {
                            tracing::info!(cid = %cid, "client: tunnel requested");
                            self.spawn_tunnel(tunnels, cid.clone());
                        }
                        Ok(ServerMessage::Shutdown) => return Ok(SessionEnd::ServerShutdown),
                        Ok(ServerMessage::Stats(s)) => {
                            tracing::info!(
                                uptime = %s.uptime,
                                total_connections = s.total_connections,
                                active_connections = s.active_connections,
                                peak_connections = s.peak_connections,
                                tunnels = s.total_tunnels,
                                clients = s.total_clients,
                                bytes_sent = %s.bytes_sent,
                                bytes_received = %s.bytes_received,
                                errors = s.total_errors,
                                "client: server stats"
                            );
                        }
                        Ok(ServerMessage::Ack(_)) | Ok(ServerMessage::Other(_)) | Err(_) => {
                            tracing::debug!(cid = %cid, msg = %line.trim(), "client: ignoring message");
                        }
                    }
                }
            }
        }
    }

    async fn send(&self, wr: &mut OwnedWriteHalf, msg: &ClientMessage) -> Result<(), ClientError> {
        let write = protocol::write_client_message(wr, msg);
        match time::timeout(self.opts.connect_timeout, write).await {
            Ok(res) => res.map_err(ClientError::Protocol),
            Err(_) => Err(ClientError::Protocol(ProtocolError::Io(
                io::ErrorKind::TimedOut.into(),
            ))),
        }
    }

    /// Fire-and-forget tunnel; its outcome is logged by the task itself.
    fn spawn_tunnel(&self, tunnels: &mut JoinSet<()>, cid: Arc<str>) {
        let opts = self.opts.clone();
        let stats = self.stats.clone();
        tunnels.spawn(async move {
            let _active = stats.active_connection(ConnectionKind::Tunnel);
            match open_tunnel(&opts, &cid, &stats).await {
                Ok(report) => tracing::info!(
                    cid = %cid,
                    from_server = report.inbound.bytes,
                    to_server = report.outbound.bytes,
                    "client: tunnel closed"
                ),
                Err(err) => {
                    match &err {
                        SpawnError::ServerUnreachable { source, .. }
                        | SpawnError::LocalUnreachable { source, .. } => {
                            stats.record_error(ErrorKind::from_io(source));
                        }
                        SpawnError::Register(_) => stats.record_error(ErrorKind::Io),
                    }
                    tracing::warn!(cid = %cid, err = %err, "client: tunnel spawn failed");
                }
            }
        });
    }
}

/// Opens one data-plane connection: register on the tunnel port, dial the local service,
/// then forward until either side closes.
pub async fn open_tunnel(
    opts: &ClientOptions,
    cid: &str,
    stats: &Statistics,
) -> Result<PumpReport, SpawnError> {
    let server_addr = opts.tunnel_addr();
    let mut tunnel = connect(&server_addr, opts.connect_timeout)
        .await
        .map_err(|source| SpawnError::ServerUnreachable {
            addr: server_addr.clone(),
            source,
        })?;
    let _ = tunnel.set_nodelay(true);

    let reg = TunnelRegistration {
        client_id: cid.to_string(),
        timestamp: now_unix_ms(),
    };
    match time::timeout(
        opts.local_connect_timeout,
        protocol::write_tunnel_registration(&mut tunnel, &reg),
    )
    .await
    {
        Ok(res) => res?,
        Err(_) => return Err(ProtocolError::Io(io::ErrorKind::TimedOut.into()).into()),
    }
    tracing::debug!(cid = %cid, server = %server_addr, "client: tunnel registered");

    let local_addr = opts.local_addr();
    let local = connect(&local_addr, opts.local_connect_timeout)
        .await
        .map_err(|source| SpawnError::LocalUnreachable {
            addr: local_addr.clone(),
            source,
        })?;
    let _ = local.set_nodelay(true);
    tracing::info!(cid = %cid, local = %local_addr, "client: tunnel active");

    Ok(forward::pump(
        tunnel,
        local,
        ("SERVER->LOCAL", "LOCAL->SERVER"),
        opts.forward,
        stats,
    )
    .await)
}

async fn connect(addr: &str, limit: Duration) -> io::Result<TcpStream> {
    match time::timeout(limit, TcpStream::connect(addr)).await {
        Ok(res) => res,
        Err(_) => Err(io::ErrorKind::TimedOut.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    async fn closed_port() -> u16 {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        drop(ln);
        port
    }

    fn opts_for(server: u16, tunnel: u16, local: u16) -> ClientOptions {
        ClientOptions {
            server_host: "127.0.0.1".into(),
            control_port: server,
            tunnel_port: tunnel,
            local_port: local,
            connect_timeout: Duration::from_secs(2),
            local_connect_timeout: Duration::from_secs(2),
            ..ClientOptions::default()
        }
    }

    #[tokio::test]
    async fn probe_fails_without_local_service() {
        let port = closed_port().await;
        let client = Client::new(opts_for(1, 1, port), Arc::new(Statistics::new()));
        let err = client.probe_local().await.unwrap_err();
        assert!(matches!(err, SpawnError::LocalUnreachable { .. }));
    }

    #[tokio::test]
    async fn run_refuses_to_start_without_local_service() {
        let port = closed_port().await;
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_port = control.local_addr().unwrap().port();

        let client = Client::new(opts_for(control_port, 1, port), Arc::new(Statistics::new()));
        let (_tx, rx) = watch::channel(false);
        assert!(client.run(rx).await.is_err());

        // The control port never saw a connection.
        let accepted = time::timeout(Duration::from_millis(50), control.accept()).await;
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn spawn_distinguishes_unreachable_server() {
        let server = closed_port().await;
        let stats = Statistics::new();
        let err = open_tunnel(&opts_for(1, server, 1), "client-1", &stats)
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::ServerUnreachable { .. }));
    }

    #[tokio::test]
    async fn spawn_distinguishes_unreachable_local_service() {
        let tunnel_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel_port = tunnel_ln.local_addr().unwrap().port();
        let local = closed_port().await;

        let server = tokio::spawn(async move {
            let (s, _) = tunnel_ln.accept().await.unwrap();
            let mut line = String::new();
            BufReader::new(s).read_line(&mut line).await.unwrap();
            line
        });

        let stats = Statistics::new();
        let err = open_tunnel(&opts_for(1, tunnel_port, local), "client-7", &stats)
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::LocalUnreachable { .. }));

        let reg: TunnelRegistration = serde_json::from_str(server.await.unwrap().trim()).unwrap();
        assert_eq!(reg.client_id, "client-7");
        assert!(reg.timestamp > 0);
    }

    #[tokio::test]
    async fn answers_each_ping_with_one_pong_and_spawns_on_request() {
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = local.local_addr().unwrap().port();
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_port = control.local_addr().unwrap().port();
        let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel_port = tunnel.local_addr().unwrap().port();

        let client = Client::new(
            opts_for(control_port, tunnel_port, local_port),
            Arc::new(Statistics::new()),
        );
        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { client.run(rx).await });

        // The local probe connects once and closes.
        let (probe, _) = local.accept().await.unwrap();
        drop(probe);

        let (ctl, _) = control.accept().await.unwrap();
        let (rd, mut wr) = ctl.into_split();
        let mut rd = BufReader::new(rd);
        let mut line = String::new();
        rd.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), CLIENT_HELLO);

        let ack = ServerMessage::Ack(protocol::Ack::new("client-42")).encode().unwrap();
        wr.write_all(format!("{ack}\n").as_bytes()).await.unwrap();

        // Initial tunnel after the ACK.
        let (t1, _) = tunnel.accept().await.unwrap();
        let mut t1 = BufReader::new(t1);
        let mut reg = String::new();
        t1.read_line(&mut reg).await.unwrap();
        assert!(reg.contains("client-42"));

        wr.write_all(b"PING\nPING\nPING\n").await.unwrap();
        for _ in 0..3 {
            line.clear();
            rd.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim(), "PONG");
        }

        wr.write_all(b"TUNNEL_REQUEST\n").await.unwrap();
        let (t2, _) = tunnel.accept().await.unwrap();
        let mut t2 = BufReader::new(t2);
        reg.clear();
        t2.read_line(&mut reg).await.unwrap();
        assert!(reg.contains("client-42"));

        tx.send(true).unwrap();
        run.await.unwrap().unwrap();

        // No stray pong after the three pings.
        let mut rest = Vec::new();
        rd.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
