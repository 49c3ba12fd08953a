use std::{io, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time,
};

use crate::backhaul::telemetry::{ErrorKind, Statistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOptions {
    pub chunk_size: usize,
    /// Zero disables the idle timeout.
    pub idle_timeout: Duration,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Why one direction of a forward stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardEnd {
    Eof,
    IdleTimeout,
    Reset,
    BrokenPipe,
    Failed(io::ErrorKind),
}

impl ForwardEnd {
    fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => ForwardEnd::Reset,
            io::ErrorKind::BrokenPipe => ForwardEnd::BrokenPipe,
            io::ErrorKind::TimedOut => ForwardEnd::IdleTimeout,
            other => ForwardEnd::Failed(other),
        }
    }

    pub fn error_kind(self) -> Option<ErrorKind> {
        match self {
            ForwardEnd::Eof => None,
            ForwardEnd::IdleTimeout => Some(ErrorKind::IdleTimeout),
            ForwardEnd::Reset => Some(ErrorKind::TransportReset),
            ForwardEnd::BrokenPipe => Some(ErrorKind::BrokenPipe),
            ForwardEnd::Failed(_) => Some(ErrorKind::Io),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub bytes: u64,
    pub end: ForwardEnd,
}

/// Both halves of a paired forward. `inbound` flows from the remote-facing side `a` to `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub inbound: ForwardOutcome,
    pub outbound: ForwardOutcome,
}

/// Copies `src` into `dst` one chunk at a time until EOF, idle timeout or error, then shuts
/// down the write side of `dst`. Each chunk is flushed before the next read, so a slow
/// destination throttles the source instead of piling up in memory.
pub async fn forward<R, W>(mut src: R, mut dst: W, direction: &str, opts: ForwardOptions) -> ForwardOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; opts.chunk_size.max(1)];
    let mut bytes: u64 = 0;

    let end = loop {
        let n = match bounded(opts.idle_timeout, src.read(&mut buf)).await {
            Ok(0) => break ForwardEnd::Eof,
            Ok(n) => n,
            Err(e) => break ForwardEnd::from_io(&e),
        };

        let write = async {
            dst.write_all(&buf[..n]).await?;
            dst.flush().await
        };
        if let Err(e) = bounded(opts.idle_timeout, write).await {
            break ForwardEnd::from_io(&e);
        }

        bytes += n as u64;
        tracing::trace!(direction, n, total = bytes, "forward: chunk");
    };

    let _ = dst.shutdown().await;

    match end {
        ForwardEnd::Eof => tracing::debug!(direction, bytes, "forward: closed"),
        ForwardEnd::IdleTimeout => tracing::warn!(direction, bytes, "forward: idle timeout"),
        ForwardEnd::Reset => tracing::warn!(direction, bytes, "forward: connection reset by peer"),
        ForwardEnd::BrokenPipe => tracing::warn!(direction, bytes, "forward: broken pipe"),
        ForwardEnd::Failed(kind) => {
            tracing::warn!(direction, bytes, err = %kind, "forward: failed")
        }
    }

    ForwardOutcome { bytes, end }
}

/// Runs both directions concurrently and waits for both to finish. Bytes flowing from `a`
/// into `b` are counted as received; bytes flowing back to `a` as sent.
pub async fn pump<A, B>(
    a: A,
    b: B,
    labels: (&str, &str),
    opts: ForwardOptions,
    stats: &Statistics,
) -> PumpReport
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (a_rd, a_wr) = tokio::io::split(a);
    let (b_rd, b_wr) = tokio::io::split(b);

    let (inbound, outbound) = tokio::join!(
        forward(a_rd, b_wr, labels.0, opts),
        forward(b_rd, a_wr, labels.1, opts),
    );

    stats.record_bytes(outbound.bytes, inbound.bytes);
    for end in [inbound.end, outbound.end] {
        if let Some(kind) = end.error_kind() {
            stats.record_error(kind);
        }
    }

    PumpReport { inbound, outbound }
}

async fn bounded<T, F>(limit: Duration, fut: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    if limit.is_zero() {
        return fut.await;
    }
    match time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ForwardOptions {
        ForwardOptions {
            chunk_size: 4,
            idle_timeout: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn copies_until_eof_and_closes_destination() {
        let (mut src_w, src_r) = tokio::io::duplex(64);
        let (dst_w, mut dst_r) = tokio::io::duplex(64);

        src_w.write_all(b"hello world").await.unwrap();
        drop(src_w);

        let out = forward(src_r, dst_w, "test", opts()).await;
        assert_eq!(out, ForwardOutcome { bytes: 11, end: ForwardEnd::Eof });

        let mut got = String::new();
        dst_r.read_to_string(&mut got).await.unwrap();
        assert_eq!(got, "hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_source_times_out() {
        let (_src_w, src_r) = tokio::io::duplex(64);
        let (dst_w, _dst_r) = tokio::io::duplex(64);

        let o = ForwardOptions {
            chunk_size: 8,
            idle_timeout: Duration::from_secs(5),
        };
        let out = forward(src_r, dst_w, "idle", o).await;
        assert_eq!(out.end, ForwardEnd::IdleTimeout);
        assert_eq!(out.end.error_kind(), Some(ErrorKind::IdleTimeout));
    }

    #[tokio::test]
    async fn closed_destination_is_broken_pipe() {
        let (mut src_w, src_r) = tokio::io::duplex(64);
        let (dst_w, dst_r) = tokio::io::duplex(64);
        drop(dst_r);

        src_w.write_all(b"data").await.unwrap();
        let out = forward(src_r, dst_w, "pipe", opts()).await;
        assert_eq!(out.end, ForwardEnd::BrokenPipe);
        assert_eq!(out.bytes, 0);
    }

    #[tokio::test]
    async fn slow_destination_applies_backpressure() {
        // The destination buffer holds 8 bytes; nothing drains it, so the forward must stall
        // after at most one buffer's worth plus one chunk instead of reading everything.
        let (mut src_w, src_r) = tokio::io::duplex(1024);
        let (dst_w, _dst_r) = tokio::io::duplex(8);
        src_w.write_all(&[7u8; 512]).await.unwrap();

        let res = time::timeout(
            Duration::from_millis(50),
            forward(src_r, dst_w, "slow", opts()),
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn pump_moves_both_directions_and_counts_bytes() {
        let (user, user_peer) = tokio::io::duplex(256);
        let (tunnel, tunnel_peer) = tokio::io::duplex(256);
        let stats = Statistics::new();

        let remote = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(tunnel_peer);
            let mut buf = [0u8; 4];
            rd.read_exact(&mut buf).await.unwrap();
            wr.write_all(b"pong!").await.unwrap();
            wr.shutdown().await.unwrap();
            buf
        });

        let user_side = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(user_peer);
            wr.write_all(b"ping").await.unwrap();
            wr.shutdown().await.unwrap();
            let mut got = Vec::new();
            rd.read_to_end(&mut got).await.unwrap();
            got
        });

        let report = pump(user, tunnel, ("USER->TUNNEL", "TUNNEL->USER"), opts(), &stats).await;

        assert_eq!(&remote.await.unwrap(), b"ping");
        assert_eq!(user_side.await.unwrap(), b"pong!");
        assert_eq!(report.inbound.bytes, 4);
        assert_eq!(report.outbound.bytes, 5);
        assert_eq!(stats.bytes(), (5, 4));
        assert_eq!(stats.summary().total_errors, 0);
    }
}
