use std::{collections::VecDeque, time::Duration};

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

pub const TUNNEL_WINDOW: Duration = Duration::from_secs(60);

/// Why a client was refused. The `Display` text is what public users are shown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitDenied {
    #[error("Max connections ({max}) exceeded")]
    TooManyConnections { max: usize },
    #[error("Tunnel rate limit ({max}/min) exceeded")]
    TunnelRate { max: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub max_connections_per_client: usize,
    pub max_tunnels_per_minute: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_connections_per_client: 10,
            max_tunnels_per_minute: 60,
        }
    }
}

/// Per-client open-connection counters and sliding one-minute tunnel windows.
#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimits,
    connections: DashMap<String, usize>,
    tunnel_windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            connections: DashMap::new(),
            tunnel_windows: DashMap::new(),
        }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Admits one more connection for `client_id` if it is under its limit. The compare and the
    /// increment happen under one map entry lock; the slot is given back when the guard drops.
    pub fn try_acquire(&self, client_id: &str) -> Result<ConnectionSlot<'_>, RateLimitDenied> {
        let max = self.limits.max_connections_per_client;
        let mut n = self.connections.entry(client_id.to_string()).or_insert(0);
        if *n >= max {
            drop(n);
            self.connections.remove_if(client_id, |_, n| *n == 0);
            return Err(RateLimitDenied::TooManyConnections { max });
        }
        *n += 1;
        Ok(ConnectionSlot {
            limiter: self,
            client_id: client_id.to_string(),
        })
    }

    /// Checks the window and, when allowed, records one tunnel creation.
    pub fn check_tunnel_rate(&self, client_id: &str) -> Result<(), RateLimitDenied> {
        self.check_tunnel_rate_at(client_id, Instant::now())
    }

    pub fn check_tunnel_rate_at(&self, client_id: &str, now: Instant) -> Result<(), RateLimitDenied> {
        let max = self.limits.max_tunnels_per_minute;
        let mut window = self
            .tunnel_windows
            .entry(client_id.to_string())
            .or_default();

        while let Some(front) = window.front() {
            if now.saturating_duration_since(*front) >= TUNNEL_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= max {
            return Err(RateLimitDenied::TunnelRate { max });
        }
        window.push_back(now);
        Ok(())
    }

    pub fn register_connection(&self, client_id: &str) {
        *self.connections.entry(client_id.to_string()).or_insert(0) += 1;
    }

    pub fn unregister_connection(&self, client_id: &str) {
        if let Some(mut n) = self.connections.get_mut(client_id) {
            *n = n.saturating_sub(1);
        }
        self.connections.remove_if(client_id, |_, n| *n == 0);
    }

    /// Drops every trace of a client once its registration is gone.
    pub fn forget(&self, client_id: &str) {
        self.connections.remove(client_id);
        self.tunnel_windows.remove(client_id);
    }

    pub fn connection_count(&self, client_id: &str) -> usize {
        self.connections.get(client_id).map(|n| *n).unwrap_or(0)
    }

    pub fn tracked_clients(&self) -> usize {
        self.connections.len()
    }
}

/// A held connection slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct ConnectionSlot<'a> {
    limiter: &'a RateLimiter,
    client_id: String,
}

impl Drop for ConnectionSlot<'_> {
    fn drop(&mut self) {
        self.limiter.unregister_connection(&self.client_id);
    }
}
