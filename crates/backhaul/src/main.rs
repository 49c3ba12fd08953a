mod backhaul;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use backhaul::config::{ClientOverrides, LoggingOverrides, ServerOverrides};

#[derive(Debug, Parser)]
#[command(
    name = "backhaul",
    version,
    about = "Backhaul - reverse TCP tunnel relay"
)]
struct Cli {
    /// Optional config file (.toml/.yaml/.yml). Command-line flags override its values.
    #[arg(long, global = true, env = "BACKHAUL_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct LogArgs {
    /// debug, info, warn (or warning), error.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// text or json.
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// stderr, stdout, discard, or a file path.
    #[arg(long, global = true)]
    log_output: Option<String>,

    /// Shorthand for --log-level debug.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public relay.
    Server(ServerArgs),
    /// Expose a local service through a relay.
    Client(ClientArgs),
}

#[derive(Debug, Args)]
struct ServerArgs {
    /// Bind address for all three listeners (default 0.0.0.0).
    #[arg(long)]
    host: Option<String>,
    /// Public traffic port (default 8080).
    #[arg(long)]
    public_port: Option<u16>,
    /// Client control port (default 8081).
    #[arg(long)]
    control_port: Option<u16>,
    /// Client tunnel port (default 8082).
    #[arg(long)]
    tunnel_port: Option<u16>,
    /// Open connections allowed per client (default 10).
    #[arg(long)]
    max_connections: Option<usize>,
    /// Tunnels a client may create per minute (default 60).
    #[arg(long)]
    max_tunnels_per_minute: Option<usize>,
    /// Seconds between statistics summaries; 0 disables (default 60).
    #[arg(long)]
    stats_interval: Option<u64>,
    /// Admin HTTP address, e.g. 127.0.0.1:9100 or :9100 (default disabled).
    #[arg(long)]
    admin_addr: Option<String>,
}

#[derive(Debug, Args)]
struct ClientArgs {
    /// Relay host (default localhost).
    #[arg(long)]
    server: Option<String>,
    /// Relay control port (default 8081).
    #[arg(long)]
    control_port: Option<u16>,
    /// Relay tunnel port (default 8082).
    #[arg(long)]
    tunnel_port: Option<u16>,
    /// Local service host (default 127.0.0.1).
    #[arg(long)]
    local_host: Option<String>,
    /// Local service port (default 5555).
    #[arg(long)]
    local_port: Option<u16>,
    /// Ask the relay for its statistics after registering.
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log = LoggingOverrides {
        level: cli.log.log_level,
        format: cli.log.log_format,
        output: cli.log.log_output,
        debug: cli.log.debug,
    };

    match cli.command {
        Command::Server(a) => {
            let o = ServerOverrides {
                host: a.host,
                public_port: a.public_port,
                control_port: a.control_port,
                tunnel_port: a.tunnel_port,
                max_connections: a.max_connections,
                max_tunnels_per_minute: a.max_tunnels_per_minute,
                stats_interval_secs: a.stats_interval,
                admin_addr: a.admin_addr,
            };
            backhaul::app::run_server(cli.config, o, log).await
        }
        Command::Client(a) => {
            let o = ClientOverrides {
                server_host: a.server,
                control_port: a.control_port,
                tunnel_port: a.tunnel_port,
                local_host: a.local_host,
                local_port: a.local_port,
                request_stats: a.stats,
            };
            backhaul::app::run_client(cli.config, o, log).await
        }
    }
}
