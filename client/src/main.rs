use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use outpost::{AdminClient, ConfigFile, Protocol, TunnelConfig, TunnelSessionManager};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "outpost")]
#[command(author = "Outpost Team")]
#[command(version)]
#[command(about = "Expose local services through an Outpost tunnel broker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Broker URL
    #[arg(long, env = "OUTPOST_SERVER", global = true)]
    server: Option<String>,

    /// Authentication token
    #[arg(long, env = "OUTPOST_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Config file (defaults to outpost.yml in the current or home directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose HTTP service
    Http {
        /// Local port to expose
        port: u16,

        /// Custom subdomain
        #[arg(short, long)]
        subdomain: Option<String>,

        /// Local host to forward to
        #[arg(long)]
        host: Option<String>,
    },
    /// Expose TCP service
    Tcp {
        /// Local port to expose
        port: u16,

        /// Custom subdomain
        #[arg(short, long)]
        subdomain: Option<String>,

        /// Local host to forward to
        #[arg(long)]
        host: Option<String>,
    },
    /// Run the tunnel described by the config file
    Start,
    /// Manage tunnels through the admin API
    Tunnels {
        /// Admin API URL (defaults to the broker URL)
        #[arg(long)]
        api: Option<String>,

        #[command(subcommand)]
        action: TunnelsAction,
    },
}

#[derive(Subcommand)]
enum TunnelsAction {
    /// List your tunnels
    List,
    /// Delete a tunnel
    Delete { id: String },
    /// Show traffic statistics for a tunnel
    Stats { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let file = match cli.config.clone().or_else(ConfigFile::find_config) {
        Some(path) => {
            info!("Using config file {}", path.display());
            Some(ConfigFile::load(&path)?)
        }
        None => None,
    };

    match cli.command {
        Commands::Http { port, subdomain, host } => {
            let config = tunnel_config(&cli.server, &cli.token, file.as_ref(), Protocol::Http, port, subdomain, host)?;
            run_tunnel(config).await?;
        }
        Commands::Tcp { port, subdomain, host } => {
            let config = tunnel_config(&cli.server, &cli.token, file.as_ref(), Protocol::Tcp, port, subdomain, host)?;
            run_tunnel(config).await?;
        }
        Commands::Start => {
            let file = file.context("No config file found; pass --config or create outpost.yml")?;
            let mut config = file.tunnel_config();
            if let Some(server) = cli.server {
                config.server_url = server;
            }
            if let Some(token) = cli.token {
                config.token = token;
            }
            run_tunnel(config).await?;
        }
        Commands::Tunnels { api, action } => {
            let api = api
                .or_else(|| file.as_ref().and_then(|f| f.api_url.clone()))
                .or_else(|| cli.server.clone())
                .or_else(|| file.as_ref().map(|f| f.server_url.clone()))
                .context("No API URL; pass --api or --server")?;
            let token = cli
                .token
                .or_else(|| file.as_ref().and_then(|f| f.auth_token.clone()))
                .unwrap_or_default();
            run_admin(&api, token, action).await?;
        }
    }

    Ok(())
}

/// Build session settings from flags, falling back to the config file
fn tunnel_config(
    server: &Option<String>,
    token: &Option<String>,
    file: Option<&ConfigFile>,
    protocol: Protocol,
    port: u16,
    subdomain: Option<String>,
    host: Option<String>,
) -> Result<TunnelConfig> {
    let mut config = match (file, server) {
        (Some(file), _) => file.tunnel_config(),
        (None, Some(server)) => TunnelConfig::new(server.clone(), String::new(), String::new()),
        (None, None) => anyhow::bail!("No broker URL; pass --server or set OUTPOST_SERVER"),
    };

    if let Some(server) = server {
        config.server_url = server.clone();
    }
    if let Some(token) = token {
        config.token = token.clone();
    }
    if let Some(subdomain) = subdomain {
        config.subdomain = subdomain;
    }
    if config.subdomain.is_empty() {
        config.subdomain = gen_subdomain();
    }
    if let Some(host) = host {
        config.local_host = host;
    }
    config.protocol = protocol;
    config.local_port = port;

    Ok(config)
}

async fn run_tunnel(config: TunnelConfig) -> Result<()> {
    let mut manager = TunnelSessionManager::new(config)?;
    let tunnel = manager.open().await.context("Failed to create tunnel")?;

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  Outpost Active                                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Public URL: {:<47} ║", tunnel.public_url);
    println!("║  Local:      {:<47} ║", format!("{}://{}:{}", tunnel.protocol, tunnel.local_host, tunnel.local_port));
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop the tunnel\n");

    let close = manager.close_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            close.close();
        }
    });

    let result = manager.run().await;

    if let Some(tunnel) = manager.tunnel() {
        println!(
            "\n✓ Tunnel stopped ({} bytes sent, {} bytes received)",
            tunnel.bytes_sent, tunnel.bytes_recv
        );
    }

    result.context("Tunnel session failed")
}

async fn run_admin(api: &str, token: String, action: TunnelsAction) -> Result<()> {
    let client = AdminClient::new(api, token)?;

    match action {
        TunnelsAction::List => {
            let tunnels = client.list_tunnels().await?;
            if tunnels.is_empty() {
                println!("No tunnels");
            }
            for t in tunnels {
                println!("{:<20} {:<6} {:<8} {}", t.id, t.protocol, t.status, t.public_url);
            }
        }
        TunnelsAction::Delete { id } => {
            client.delete_tunnel(&id).await?;
            println!("✓ Deleted tunnel {}", id);
        }
        TunnelsAction::Stats { id } => {
            let stats = client.get_tunnel_stats(&id).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

fn gen_subdomain() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("t{:x}", millis % 0xFFFFFF)
}
