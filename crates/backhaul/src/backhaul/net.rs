use std::net::SocketAddr;

use anyhow::Context;

/// Builds a `host:port` string for binding or dialing. Bare IPv6 hosts are bracketed and an
/// empty host means every interface.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.is_empty() {
        format!("0.0.0.0:{port}")
    } else if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Parses a listen address, accepting the `":PORT"` shorthand for all interfaces.
pub fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = addr.trim();
    let full = match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    };
    full.parse()
        .with_context(|| format!("invalid listen address {addr:?}"))
}
