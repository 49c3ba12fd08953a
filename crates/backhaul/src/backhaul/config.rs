use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::backhaul::tunnel::{
    backoff::BackoffPolicy, client::ClientOptions, forward::ForwardOptions,
    ratelimit::RateLimits, server::ServerOptions,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub server: ServerOptions,
    pub client: ClientOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_addr: String::new(),
            logging: LoggingConfig::default(),
            server: ServerOptions::default(),
            client: ClientOptions::default(),
        }
    }
}

/// Command-line values for the `server` subcommand; `None` keeps the file/default value.
#[derive(Debug, Clone, Default)]
pub struct ServerOverrides {
    pub host: Option<String>,
    pub public_port: Option<u16>,
    pub control_port: Option<u16>,
    pub tunnel_port: Option<u16>,
    pub max_connections: Option<usize>,
    pub max_tunnels_per_minute: Option<usize>,
    pub stats_interval_secs: Option<u64>,
    pub admin_addr: Option<String>,
}

/// Command-line values for the `client` subcommand.
#[derive(Debug, Clone, Default)]
pub struct ClientOverrides {
    pub server_host: Option<String>,
    pub control_port: Option<u16>,
    pub tunnel_port: Option<u16>,
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    pub request_stats: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LoggingOverrides {
    pub level: Option<String>,
    pub format: Option<String>,
    pub output: Option<String>,
    pub debug: bool,
}

/// Loads the optional config file; no path means pure defaults.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => load_config(p).with_context(|| format!("load config: {}", p.display())),
        None => Ok(Config::default()),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    let cfg = Config::from_file_config(fc);
    cfg.validate()?;
    Ok(cfg)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    server: Option<FileServer>,
    client: Option<FileClient>,
    forward: Option<FileForward>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    bind_host: Option<String>,
    public_port: Option<u16>,
    control_port: Option<u16>,
    tunnel_port: Option<u16>,
    max_connections_per_client: Option<usize>,
    max_tunnels_per_minute: Option<usize>,
    stats_interval_secs: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    control_idle_timeout_ms: Option<u64>,
    max_ping_failures: Option<u32>,
    tunnel_registration_timeout_ms: Option<u64>,
    tunnel_wait_timeout_ms: Option<u64>,
    unclaimed_tunnel_ttl_ms: Option<u64>,
    monitor_interval_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_host: Option<String>,
    control_port: Option<u16>,
    tunnel_port: Option<u16>,
    local_host: Option<String>,
    local_port: Option<u16>,
    connect_timeout_ms: Option<u64>,
    local_connect_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    max_reconnect_delay_ms: Option<u64>,
    reconnect_multiplier: Option<f64>,
    shutdown_grace_ms: Option<u64>,
    #[serde(default)]
    request_stats: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileForward {
    chunk_size: Option<usize>,
    idle_timeout_ms: Option<u64>,
}

fn ms(v: Option<u64>, default: Duration) -> Duration {
    v.map(Duration::from_millis).unwrap_or(default)
}

fn host(v: Option<String>, default: String) -> String {
    match v {
        Some(h) if !h.trim().is_empty() => h.trim().to_string(),
        _ => default,
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> Config {
        let defaults = Config::default();

        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: l.level.unwrap_or(defaults.logging.level),
                format: l.format.unwrap_or(defaults.logging.format),
                output: l.output.unwrap_or(defaults.logging.output),
                add_source: l.add_source,
            },
            None => defaults.logging,
        };

        let fwd = fc.forward.unwrap_or_default();
        let forward = ForwardOptions {
            chunk_size: fwd.chunk_size.unwrap_or(defaults.server.forward.chunk_size),
            idle_timeout: ms(fwd.idle_timeout_ms, defaults.server.forward.idle_timeout),
        };

        let s = fc.server.unwrap_or_default();
        let ds = defaults.server;
        let server = ServerOptions {
            bind_host: host(s.bind_host, ds.bind_host),
            public_port: s.public_port.unwrap_or(ds.public_port),
            control_port: s.control_port.unwrap_or(ds.control_port),
            tunnel_port: s.tunnel_port.unwrap_or(ds.tunnel_port),
            limits: RateLimits {
                max_connections_per_client: s
                    .max_connections_per_client
                    .unwrap_or(ds.limits.max_connections_per_client),
                max_tunnels_per_minute: s
                    .max_tunnels_per_minute
                    .unwrap_or(ds.limits.max_tunnels_per_minute),
            },
            stats_interval: s
                .stats_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(ds.stats_interval),
            handshake_timeout: ms(s.handshake_timeout_ms, ds.handshake_timeout),
            control_idle_timeout: ms(s.control_idle_timeout_ms, ds.control_idle_timeout),
            max_ping_failures: s.max_ping_failures.unwrap_or(ds.max_ping_failures),
            tunnel_registration_timeout: ms(
                s.tunnel_registration_timeout_ms,
                ds.tunnel_registration_timeout,
            ),
            tunnel_wait_timeout: ms(s.tunnel_wait_timeout_ms, ds.tunnel_wait_timeout),
            unclaimed_tunnel_ttl: ms(s.unclaimed_tunnel_ttl_ms, ds.unclaimed_tunnel_ttl),
            monitor_interval: ms(s.monitor_interval_ms, ds.monitor_interval),
            write_timeout: ms(s.write_timeout_ms, ds.write_timeout),
            drain_timeout: ms(s.drain_timeout_ms, ds.drain_timeout),
            forward,
        };

        let c = fc.client.unwrap_or_default();
        let dc = defaults.client;
        let client = ClientOptions {
            server_host: host(c.server_host, dc.server_host),
            control_port: c.control_port.unwrap_or(dc.control_port),
            tunnel_port: c.tunnel_port.unwrap_or(dc.tunnel_port),
            local_host: host(c.local_host, dc.local_host),
            local_port: c.local_port.unwrap_or(dc.local_port),
            connect_timeout: ms(c.connect_timeout_ms, dc.connect_timeout),
            local_connect_timeout: ms(c.local_connect_timeout_ms, dc.local_connect_timeout),
            read_timeout: ms(c.read_timeout_ms, dc.read_timeout),
            handshake_timeout: ms(c.handshake_timeout_ms, dc.handshake_timeout),
            backoff: BackoffPolicy {
                base: ms(c.reconnect_delay_ms, dc.backoff.base),
                max: ms(c.max_reconnect_delay_ms, dc.backoff.max),
                multiplier: c.reconnect_multiplier.unwrap_or(dc.backoff.multiplier),
            },
            shutdown_grace: ms(c.shutdown_grace_ms, dc.shutdown_grace),
            request_stats: c.request_stats,
            forward,
        };

        Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            server,
            client,
        }
    }

    pub fn apply_server_overrides(&mut self, o: &ServerOverrides) {
        let s = &mut self.server;
        if let Some(h) = &o.host {
            s.bind_host = h.trim().to_string();
        }
        if let Some(p) = o.public_port {
            s.public_port = p;
        }
        if let Some(p) = o.control_port {
            s.control_port = p;
        }
        if let Some(p) = o.tunnel_port {
            s.tunnel_port = p;
        }
        if let Some(n) = o.max_connections {
            s.limits.max_connections_per_client = n;
        }
        if let Some(n) = o.max_tunnels_per_minute {
            s.limits.max_tunnels_per_minute = n;
        }
        if let Some(secs) = o.stats_interval_secs {
            s.stats_interval = Duration::from_secs(secs);
        }
        if let Some(a) = &o.admin_addr {
            self.admin_addr = a.trim().to_string();
        }
    }

    pub fn apply_client_overrides(&mut self, o: &ClientOverrides) {
        let c = &mut self.client;
        if let Some(h) = &o.server_host {
            c.server_host = h.trim().to_string();
        }
        if let Some(p) = o.control_port {
            c.control_port = p;
        }
        if let Some(p) = o.tunnel_port {
            c.tunnel_port = p;
        }
        if let Some(h) = &o.local_host {
            c.local_host = h.trim().to_string();
        }
        if let Some(p) = o.local_port {
            c.local_port = p;
        }
        if o.request_stats {
            c.request_stats = true;
        }
    }

    pub fn apply_logging_overrides(&mut self, o: &LoggingOverrides) {
        if let Some(l) = &o.level {
            self.logging.level = l.clone();
        }
        if let Some(f) = &o.format {
            self.logging.format = f.clone();
        }
        if let Some(out) = &o.output {
            self.logging.output = out.clone();
        }
        if o.debug {
            self.logging.level = "debug".into();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.server;
        for (name, port) in [
            ("server.public_port", s.public_port),
            ("server.control_port", s.control_port),
            ("server.tunnel_port", s.tunnel_port),
            ("client.control_port", self.client.control_port),
            ("client.tunnel_port", self.client.tunnel_port),
            ("client.local_port", self.client.local_port),
        ] {
            if port == 0 {
                anyhow::bail!("config: {name} must be non-zero");
            }
        }
        if s.limits.max_connections_per_client == 0 {
            anyhow::bail!("config: server.max_connections_per_client must be non-zero");
        }
        if s.limits.max_tunnels_per_minute == 0 {
            anyhow::bail!("config: server.max_tunnels_per_minute must be non-zero");
        }
        if s.forward.chunk_size == 0 {
            anyhow::bail!("config: forward.chunk_size must be non-zero");
        }
        if self.client.backoff.multiplier < 1.0 {
            anyhow::bail!("config: client.reconnect_multiplier must be >= 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "backhaul_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.server.public_port, 8080);
        assert_eq!(cfg.server.control_port, 8081);
        assert_eq!(cfg.server.tunnel_port, 8082);
        assert_eq!(cfg.server.limits.max_connections_per_client, 10);
        assert_eq!(cfg.server.limits.max_tunnels_per_minute, 60);
        assert_eq!(cfg.server.tunnel_wait_timeout, Duration::from_secs(10));
        assert_eq!(cfg.client.local_port, 5555);
        assert_eq!(cfg.client.backoff.base, Duration::from_secs(5));
        assert_eq!(cfg.client.backoff.max, Duration::from_secs(60));
        assert_eq!(cfg.server.forward.chunk_size, 8192);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn loads_toml_with_partial_sections() {
        let dir = temp_dir("toml");
        let p = dir.join("backhaul.toml");
        let toml = r#"
admin_addr = ":9100"

[logging]
level = "debug"
format = "json"

[server]
public_port = 18080
max_connections_per_client = 4
tunnel_wait_timeout_ms = 2500
drain_timeout_ms = 750

[client]
local_port = 9000
reconnect_delay_ms = 1000
request_stats = true

[forward]
chunk_size = 4096
"#;
        std::fs::write(&p, toml).expect("write");
        let cfg = load_config(&p).expect("load_config");

        assert_eq!(cfg.admin_addr, ":9100");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.logging.output, "stderr");
        assert_eq!(cfg.server.public_port, 18080);
        assert_eq!(cfg.server.control_port, 8081);
        assert_eq!(cfg.server.limits.max_connections_per_client, 4);
        assert_eq!(cfg.server.tunnel_wait_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.server.drain_timeout, Duration::from_millis(750));
        assert_eq!(cfg.client.local_port, 9000);
        assert_eq!(cfg.client.backoff.base, Duration::from_secs(1));
        assert!(cfg.client.request_stats);
        assert_eq!(cfg.server.forward.chunk_size, 4096);
        assert_eq!(cfg.client.forward.chunk_size, 4096);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn loads_yaml() {
        let dir = temp_dir("yaml");
        let p = dir.join("backhaul.yaml");
        let yaml = "server:\n  bind_host: 127.0.0.1\n  tunnel_port: 19082\nclient:\n  server_host: relay.example\n";
        std::fs::write(&p, yaml).expect("write");
        let cfg = load_config(&p).expect("load_config");
        assert_eq!(cfg.server.bind_host, "127.0.0.1");
        assert_eq!(cfg.server.tunnel_port, 19082);
        assert_eq!(cfg.client.server_host, "relay.example");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_unknown_fields_and_zero_limits() {
        let dir = temp_dir("reject");
        let p = dir.join("backhaul.toml");

        std::fs::write(&p, "[server]\npublic_prot = 1\n").expect("write");
        assert!(load_config(&p).is_err());

        std::fs::write(&p, "[server]\nmax_tunnels_per_minute = 0\n").expect("write");
        let err = load_config(&p).unwrap_err().to_string();
        assert!(err.contains("max_tunnels_per_minute"));

        std::fs::write(&p, "[client]\nlocal_port = 0\n").expect("write");
        assert!(load_config(&p).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cli_overrides_win() {
        let mut cfg = Config::default();
        cfg.apply_server_overrides(&ServerOverrides {
            public_port: Some(9080),
            max_connections: Some(3),
            admin_addr: Some("127.0.0.1:9100".into()),
            ..Default::default()
        });
        cfg.apply_client_overrides(&ClientOverrides {
            local_port: Some(3000),
            request_stats: true,
            ..Default::default()
        });
        cfg.apply_logging_overrides(&LoggingOverrides {
            level: Some("warn".into()),
            debug: true,
            ..Default::default()
        });

        assert_eq!(cfg.server.public_port, 9080);
        assert_eq!(cfg.server.limits.max_connections_per_client, 3);
        assert_eq!(cfg.admin_addr, "127.0.0.1:9100");
        assert_eq!(cfg.client.local_port, 3000);
        assert!(cfg.client.request_stats);
        assert_eq!(cfg.logging.level, "debug");
    }
}
