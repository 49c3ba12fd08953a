use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, time::MissedTickBehavior};

use crate::backhaul::{
    telemetry::ErrorKind,
    tunnel::{control::release_client, server::RelayContext},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reaped: usize,
    pub pruned_tunnels: usize,
}

/// Periodic liveness sweep. Reaps registrations whose control handler has gone away or
/// whose channel has been silent for longer than the heartbeat could explain.
pub async fn run_monitor(ctx: Arc<RelayContext>, mut shutdown: watch::Receiver<bool>) {
    let every = ctx.opts.monitor_interval;
    if every.is_zero() {
        return;
    }

    let mut tick = tokio::time::interval(every);
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
                let report = sweep(&ctx).await;
                if report != SweepReport::default() {
                    tracing::info!(
                        reaped = report.reaped,
                        pruned_tunnels = report.pruned_tunnels,
                        "monitor: sweep"
                    );
                }
            }
        }
    }
}

/// Silence allowed before a registration counts as dead: every ping round plus one more
/// idle period of slack, so the control handler normally notices first.
pub fn max_silence(idle: Duration, max_ping_failures: u32) -> Duration {
    idle.saturating_mul(max_ping_failures.saturating_add(2))
}

pub async fn sweep(ctx: &RelayContext) -> SweepReport {
    let limit = max_silence(ctx.opts.control_idle_timeout, ctx.opts.max_ping_failures);
    let mut report = SweepReport::default();

    for cid in ctx.manager.dead_clients(limit).await {
        if release_client(ctx, &cid).await {
            tracing::warn!(cid = %cid, "monitor: reaped dead client");
            ctx.stats.record_error(ErrorKind::DeadClient);
            report.reaped += 1;
        }
    }

    report.pruned_tunnels = ctx.manager.prune_stale_tunnels().await;
    report
}
