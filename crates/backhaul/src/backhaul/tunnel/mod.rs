//! Reverse tunnel relay: a server with public, control and tunnel listeners, and a client
//! that keeps a control channel open and dials a fresh tunnel per public session.
//!
//! Wire format (newline-terminated UTF-8 lines):
//! - control, client -> server: `BACKHAUL_CLIENT v1`, then `PONG` / `STATS_REQUEST`
//! - control, server -> client: `{"type":"ACK",...}`, `PING`, `TUNNEL_REQUEST`,
//!   `SERVER_SHUTDOWN`, `{"type":"STATS","data":{...}}`
//! - tunnel, client -> server: one `{"client_id":...,"timestamp":...}` line, then raw bytes

pub mod backoff;
pub mod client;
pub mod control;
pub mod forward;
pub mod manager;
pub mod monitor;
pub mod protocol;
pub mod public;
pub mod ratelimit;
pub mod registry;
pub mod server;
