//! Burrow server CLI

use burrow_server::{LimitSpec, Server, ServerConfig, TokenSpec};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "burrow-server",
    about = "Reverse-tunnel server: expose agents behind NAT via public domains",
    version
)]
struct Cli {
    /// Address to listen on for agent connections
    #[arg(long, default_value = "0.0.0.0:8443", env = "BURROW_AGENT_ADDR")]
    agent_addr: SocketAddr,

    /// Enable TLS for agent connections
    #[arg(long, env = "BURROW_AGENT_TLS")]
    agent_tls: bool,

    /// TLS certificate file for agent connections
    #[arg(long, env = "BURROW_AGENT_CERT")]
    agent_cert: Option<PathBuf>,

    /// TLS key file for agent connections
    #[arg(long, env = "BURROW_AGENT_KEY")]
    agent_key: Option<PathBuf>,

    /// Address to listen on for public HTTP requests
    #[arg(long, default_value = "0.0.0.0:8080", env = "BURROW_PUBLIC_ADDR")]
    public_addr: SocketAddr,

    /// Enable TLS for public connections
    #[arg(long, env = "BURROW_PUBLIC_TLS")]
    public_tls: bool,

    /// TLS certificate file for public connections
    #[arg(long, env = "BURROW_PUBLIC_CERT")]
    public_cert: Option<PathBuf>,

    /// TLS key file for public connections
    #[arg(long, env = "BURROW_PUBLIC_KEY")]
    public_key: Option<PathBuf>,

    /// Base domain for tunnels
    #[arg(long, default_value = "localhost", env = "BURROW_BASE_DOMAIN")]
    base_domain: String,

    /// Maximum number of agent connections
    #[arg(long, default_value_t = 1000)]
    max_connections: usize,

    /// Maximum number of concurrent streams across all connections
    #[arg(long, default_value_t = 10_000)]
    max_streams: usize,

    /// Heartbeat timeout in seconds
    #[arg(long, default_value_t = 30)]
    heartbeat_timeout: u64,

    /// Authentication timeout in seconds
    #[arg(long, default_value_t = 10)]
    auth_timeout: u64,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,

    /// Per-agent limit, repeatable: agent_id=max_streams:rate
    #[arg(long = "agent-limit", value_name = "SPEC")]
    agent_limits: Vec<LimitSpec>,

    /// Per-domain limit, repeatable: domain=max_streams:rate
    #[arg(long = "domain-limit", value_name = "SPEC")]
    domain_limits: Vec<LimitSpec>,

    /// Static auth token, repeatable: token=agent_id
    #[arg(long = "auth-token", value_name = "TOKEN")]
    auth_tokens: Vec<TokenSpec>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting burrow server");
    tracing::info!("agent listener: {} (TLS: {})", cli.agent_addr, cli.agent_tls);
    tracing::info!("public listener: {} (TLS: {})", cli.public_addr, cli.public_tls);
    tracing::info!("base domain: {}", cli.base_domain);

    let config = ServerConfig {
        agent_addr: cli.agent_addr,
        agent_tls: cli.agent_tls,
        agent_cert: cli.agent_cert,
        agent_key: cli.agent_key,
        public_addr: cli.public_addr,
        public_tls: cli.public_tls,
        public_cert: cli.public_cert,
        public_key: cli.public_key,
        base_domain: cli.base_domain,
        max_connections: cli.max_connections,
        max_streams: cli.max_streams,
        heartbeat_timeout: Duration::from_secs(cli.heartbeat_timeout),
        auth_timeout: Duration::from_secs(cli.auth_timeout),
        request_timeout: Duration::from_secs(cli.request_timeout),
        agent_limits: cli.agent_limits,
        domain_limits: cli.domain_limits,
        auth_tokens: cli.auth_tokens,
    };

    let server = Server::new(config);

    let cancel = server.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    server.run().await
}
