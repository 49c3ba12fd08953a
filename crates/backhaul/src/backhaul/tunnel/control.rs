use std::{net::SocketAddr, sync::Arc};

use futures_util::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    time::{self, Instant},
};
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::backhaul::{
    telemetry::{ConnectionKind, ErrorKind},
    tunnel::{
        manager::Liveness,
        protocol::{self, Ack, ClientMessage, ProtocolError, ServerMessage},
        server::RelayContext,
    },
};

const OUTBOX_CAPACITY: usize = 32;

/// How a control session ended.
#[derive(Debug)]
enum SessionEnd {
    PeerClosed,
    Decode(ProtocolError),
    WriteFailed(ProtocolError),
    PingFailures(u32),
    /// The registration was removed elsewhere (monitor sweep or server shutdown).
    Evicted,
    Shutdown,
}

/// Serves one control connection from handshake to cleanup.
pub async fn handle_control(ctx: Arc<RelayContext>, stream: TcpStream, remote: SocketAddr) {
    let _active = ctx.stats.active_connection(ConnectionKind::Control);
    let _ = stream.set_nodelay(true);

    let (rd, mut wr) = stream.into_split();
    let mut lines = FramedRead::new(rd, protocol::control_codec());

    let hello = match time::timeout(ctx.opts.handshake_timeout, lines.next()).await {
        Err(_) => {
            tracing::warn!(client = %remote, "control: handshake timeout");
            ctx.stats.record_error(ErrorKind::HandshakeTimeout);
            return;
        }
        Ok(None) => {
            tracing::debug!(client = %remote, "control: closed before handshake");
            return;
        }
        Ok(Some(Err(err))) => {
            let err = ProtocolError::from(err);
            tracing::warn!(client = %remote, err = %err, "control: bad handshake");
            ctx.stats.record_error(ErrorKind::MalformedMessage);
            return;
        }
        Ok(Some(Ok(line))) => line.trim().to_string(),
    };
    if hello.is_empty() {
        tracing::warn!(client = %remote, "control: empty handshake");
        ctx.stats.record_error(ErrorKind::MalformedMessage);
        return;
    }

    let (tx, mut rx) = mpsc::channel(OUTBOX_CAPACITY);
    let Some(reg) = ctx.manager.register_client(remote.to_string(), tx).await else {
        tracing::info!(client = %remote, "control: relay shutting down, registration refused");
        let _ = send(&ctx, &mut wr, &ServerMessage::Shutdown).await;
        let _ = wr.shutdown().await;
        return;
    };
    let cid = reg.id.clone();
    ctx.limiter.register_connection(&cid);
    ctx.stats.record_client();
    reg.liveness.touch();

    tracing::info!(cid = %cid, client = %remote, hello = %hello, "control: client registered");

    let ack = ServerMessage::Ack(Ack::new(cid.clone()));
    let end = match send(&ctx, &mut wr, &ack).await {
        Ok(()) => {
            run_session(&ctx, &cid, &mut lines, &mut wr, &mut rx, &reg.liveness).await
        }
        Err(err) => SessionEnd::WriteFailed(err),
    };

    match &end {
        SessionEnd::PeerClosed => tracing::info!(cid = %cid, "control: client disconnected"),
        SessionEnd::Decode(err) => {
            tracing::warn!(cid = %cid, err = %err, "control: malformed message");
            ctx.stats.record_error(ErrorKind::MalformedMessage);
        }
        SessionEnd::WriteFailed(err) => {
            tracing::warn!(cid = %cid, err = %err, "control: write failed");
            if let ProtocolError::Io(e) = err {
                ctx.stats.record_error(ErrorKind::from_io(e));
            }
        }
        SessionEnd::PingFailures(n) => {
            tracing::warn!(cid = %cid, misses = n, "control: client stopped answering pings");
            ctx.stats.record_error(ErrorKind::PingFailure);
        }
        SessionEnd::Evicted => tracing::info!(cid = %cid, "control: registration removed"),
        SessionEnd::Shutdown => tracing::info!(cid = %cid, "control: sent shutdown notice"),
    }

    release_client(&ctx, &cid).await;
    let _ = wr.shutdown().await;
}

/// Removes a registration and frees its limiter slot. Safe to race: only the caller that
/// actually removed the entry releases anything.
pub(crate) async fn release_client(ctx: &RelayContext, cid: &str) -> bool {
    if !ctx.manager.unregister_client(cid).await {
        return false;
    }
    ctx.limiter.unregister_connection(cid);
    ctx.limiter.forget(cid);
    true
}

async fn run_session(
    ctx: &RelayContext,
    cid: &str,
    lines: &mut FramedRead<OwnedReadHalf, LinesCodec>,
    wr: &mut OwnedWriteHalf,
    rx: &mut mpsc::Receiver<ServerMessage>,
    liveness: &Liveness,
) -> SessionEnd {
    let idle_timeout = ctx.opts.control_idle_timeout;
    let max_misses = ctx.opts.max_ping_failures.max(1);
    let idle = time::sleep(idle_timeout);
    tokio::pin!(idle);
    let mut misses: u32 = 0;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    return SessionEnd::Evicted;
                };
                let sent = send(ctx, wr, &msg).await;
                if msg == ServerMessage::Shutdown {
                    return SessionEnd::Shutdown;
                }
                if let Err(err) = sent {
                    return SessionEnd::WriteFailed(err);
                }
            }
            line = lines.next() => {
                let line = match line {
                    None => return SessionEnd::PeerClosed,
                    Some(Err(err)) => return SessionEnd::Decode(err.into()),
                    Some(Ok(line)) => line,
                };
                idle.as_mut().reset(Instant::now() + idle_timeout);
                liveness.touch();

                match ClientMessage::decode(&line) {
                    Ok(ClientMessage::Pong) => {
                        tracing::debug!(cid = %cid, "control: pong");
                        misses = 0;
                    }
                    Ok(ClientMessage::StatsRequest) => {
                        let reply = ServerMessage::Stats(ctx.stats.summary());
                        if let Err(err) = send(ctx, wr, &reply).await {
                            return SessionEnd::WriteFailed(err);
                        }
                        tracing::debug!(cid = %cid, "control: sent stats");
                    }
                    Ok(ClientMessage::Other(msg)) => {
                        tracing::debug!(cid = %cid, msg = %msg, "control: ignoring message");
                    }
                    Err(_) => {}
                }
            }
            _ = &mut idle => {
                if misses >= max_misses {
                    return SessionEnd::PingFailures(misses);
                }
                if let Err(err) = send(ctx, wr, &ServerMessage::Ping).await {
                    return SessionEnd::WriteFailed(err);
                }
                misses += 1;
                tracing::debug!(cid = %cid, misses, "control: sent ping");
                idle.as_mut().reset(Instant::now() + idle_timeout);
            }
        }
    }
}

async fn send(
    ctx: &RelayContext,
    wr: &mut OwnedWriteHalf,
    msg: &ServerMessage,
) -> Result<(), ProtocolError> {
    match time::timeout(ctx.opts.write_timeout, protocol::write_server_message(wr, msg)).await {
        Ok(res) => res,
        Err(_) => Err(ProtocolError::Io(std::io::Error::from(
            std::io::ErrorKind::TimedOut,
        ))),
    }
}
