use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::backhaul::{
    admin,
    config::{self, ClientOverrides, LoggingOverrides, ServerOverrides},
    logging, net, telemetry,
    tunnel::{client::Client, server::RelayServer},
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run_server(
    config_path: Option<PathBuf>,
    overrides: ServerOverrides,
    log: LoggingOverrides,
) -> anyhow::Result<()> {
    let mut cfg = config::load(config_path.as_deref())?;
    cfg.apply_server_overrides(&overrides);
    cfg.apply_logging_overrides(&log);
    cfg.validate()?;

    let _logrt = logging::init(&cfg.logging)?;

    let stats = Arc::new(telemetry::Statistics::new());
    let server = RelayServer::bind(cfg.server.clone(), stats.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    if !cfg.admin_addr.is_empty() {
        let addr = net::parse_listen_addr(&cfg.admin_addr).context("admin_addr")?;
        let state = admin::AdminState {
            stats: stats.clone(),
            prometheus: Arc::new(telemetry::init_prometheus()?),
            relay: server.context(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve(addr, state, shutdown).await });
    }

    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.serve(shutdown).await });
    }

    supervise(tasks, shutdown_tx).await
}

pub async fn run_client(
    config_path: Option<PathBuf>,
    overrides: ClientOverrides,
    log: LoggingOverrides,
) -> anyhow::Result<()> {
    let mut cfg = config::load(config_path.as_deref())?;
    cfg.apply_client_overrides(&overrides);
    cfg.apply_logging_overrides(&log);
    cfg.validate()?;

    let _logrt = logging::init(&cfg.logging)?;

    let stats = Arc::new(telemetry::Statistics::new());
    let client = Client::new(cfg.client.clone(), stats);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    tasks.spawn(async move { client.run(shutdown_rx).await });

    supervise(tasks, shutdown_tx).await
}

/// Waits for Ctrl-C/SIGTERM or the first task to exit, broadcasts shutdown, then drains the
/// rest with a hard cap.
async fn supervise(
    mut tasks: JoinSet<anyhow::Result<()>>,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<()> {
    let mut result = Ok(());

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Ok(()))) | None => {}
                Some(Ok(Err(err))) => result = Err(err),
                Some(Err(join_err)) => result = Err(join_err.into()),
            }
        }
    }
    let _ = shutdown_tx.send(true);

    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::warn!(err = %err, "shutdown: task failed during teardown");
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out; aborting remaining tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
