use std::{net::SocketAddr, sync::Arc};

use tokio::{io::AsyncWriteExt, net::TcpStream, sync::mpsc::error::TrySendError, time};

use crate::backhaul::{
    telemetry::{ConnectionKind, ErrorKind},
    tunnel::{
        forward,
        manager::ClientRoute,
        protocol::ServerMessage,
        registry::TunnelQueueEntry,
        server::RelayContext,
    },
};

pub const NO_CLIENTS: &str = "No clients connected. Please start a client first.";
pub const TUNNEL_TIMEOUT: &str = "Timeout waiting for tunnel connection. Client may be offline.";
pub const CLIENT_GONE: &str = "Client disconnected while waiting for tunnel.";

/// Pairs one public user connection with a tunnel from the first registered client.
pub async fn handle_public(ctx: Arc<RelayContext>, mut user: TcpStream, remote: SocketAddr) {
    let _active = ctx.stats.active_connection(ConnectionKind::Public);
    let _ = user.set_nodelay(true);

    let Some(route) = ctx.manager.first_client().await else {
        tracing::warn!(user = %remote, "public: no clients registered");
        ctx.stats.record_error(ErrorKind::NoClients);
        reject(&ctx, &mut user, NO_CLIENTS).await;
        return;
    };

    // The slot is held from here until the session ends, including the wait for a tunnel.
    let admitted = ctx.limiter.try_acquire(&route.id).and_then(|slot| {
        ctx.limiter.check_tunnel_rate(&route.id)?;
        Ok(slot)
    });
    let slot = match admitted {
        Ok(slot) => slot,
        Err(denied) => {
            tracing::warn!(user = %remote, cid = %route.id, reason = %denied, "public: rate limited");
            ctx.stats.record_error(ErrorKind::RateLimitExceeded);
            reject(&ctx, &mut user, &denied.to_string()).await;
            return;
        }
    };

    tracing::info!(user = %remote, cid = %route.id, "public: routing");

    let entry = match claim_tunnel(&ctx, &route).await {
        Ok(entry) => entry,
        Err(reason) => {
            reject(&ctx, &mut user, reason).await;
            return;
        }
    };

    let tunnel_remote = entry.remote.clone();
    let (tunnel, _tunnel_active) = entry.into_parts();
    tracing::info!(user = %remote, cid = %route.id, tunnel = %tunnel_remote, "public: tunnel established");

    let labels = (
        format!("USER[{remote}]->TUNNEL"),
        format!("TUNNEL->USER[{remote}]"),
    );
    let report = forward::pump(
        user,
        tunnel,
        (&labels.0, &labels.1),
        ctx.opts.forward,
        &ctx.stats,
    )
    .await;
    drop(slot);

    tracing::info!(
        user = %remote,
        cid = %route.id,
        received = report.inbound.bytes,
        sent = report.outbound.bytes,
        "public: session closed"
    );
}

/// Takes a ready tunnel, or asks the client for one and waits. A waiter that gives up never
/// consumes a tunnel.
async fn claim_tunnel(
    ctx: &RelayContext,
    route: &ClientRoute,
) -> Result<TunnelQueueEntry<TcpStream>, &'static str> {
    if let Some(entry) = route.tunnels.try_pop().await {
        return Ok(entry);
    }

    match route.control.try_send(ServerMessage::TunnelRequest) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            tracing::debug!(cid = %route.id, "public: control outbox full, waiting on pending requests");
        }
        Err(TrySendError::Closed(_)) => {
            ctx.stats.record_error(ErrorKind::ClientGone);
            return Err(CLIENT_GONE);
        }
    }

    match time::timeout(ctx.opts.tunnel_wait_timeout, route.tunnels.pop()).await {
        Ok(Some(entry)) => Ok(entry),
        Ok(None) => {
            tracing::warn!(cid = %route.id, "public: client went away while waiting");
            ctx.stats.record_error(ErrorKind::ClientGone);
            Err(CLIENT_GONE)
        }
        Err(_) => {
            tracing::warn!(cid = %route.id, "public: tunnel wait timed out");
            ctx.stats.record_error(ErrorKind::TunnelWaitTimeout);
            Err(TUNNEL_TIMEOUT)
        }
    }
}

async fn reject(ctx: &RelayContext, user: &mut TcpStream, reason: &str) {
    let msg = format!("ERROR: {reason}\n");
    let write = async {
        user.write_all(msg.as_bytes()).await?;
        user.shutdown().await
    };
    if let Err(err) = time::timeout(ctx.opts.write_timeout, write)
        .await
        .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
    {
        tracing::debug!(err = %err, "public: could not send error to user");
    }
}
