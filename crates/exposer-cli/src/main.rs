//! Exposer CLI - expose, link and forward services through an exposer daemon

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use exposer_cli::config::{resolve, ConfigManager};
use exposer_cli::daemon::{Daemon, DaemonConfig, DEFAULT_ADDR};
use exposer_cli::client;
use exposer_cli::forward_server::ForwardRelay;
use exposer_control::{Forwarder, KeepaliveClient, NextRoute};
use exposer_proto::Attribute;
use exposer_transport::{tcp_dialer, Listener, TcpConnListener};

/// Exposer - share local services through a central daemon
#[derive(Parser, Debug)]
#[command(name = "exposer")]
#[command(about = "Expose, link and forward services through an exposer daemon", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

/// Where the daemon is and how to authenticate
#[derive(Args, Debug, Clone)]
struct ServerArgs {
    /// Daemon URL, e.g. https://exposer.example.com
    #[arg(short, long, env = "EXPOSER_SERVER")]
    server: Option<String>,

    /// Shared key
    #[arg(short, long, env = "EXPOSER_KEY")]
    key: Option<String>,
}

impl ServerArgs {
    /// Fill a missing server URL from ~/.exposer/config.json; the key is not needed
    fn resolve_server(self) -> Result<String> {
        resolve(self.server, ConfigManager::load()?.server, "server")
    }

    /// Fill missing values from ~/.exposer/config.json
    fn resolve(self) -> Result<(String, String)> {
        let stored = ConfigManager::load()?;
        Ok((
            resolve(self.server, stored.server, "server")?,
            resolve(self.key, stored.key, "key")?,
        ))
    }
}

/// Client side tunables
#[derive(Args, Debug, Clone)]
struct ClientArgs {
    /// Seconds between keepalive pings
    #[arg(long, default_value = "20")]
    keepalive_interval: u64,

    /// Seconds without a pong before the connection is considered dead
    #[arg(long, default_value = "30")]
    keepalive_timeout: u64,

    /// Seconds to keep a forwarded connection open after one side finished
    #[arg(long, default_value = "8")]
    drain_delay: u64,
}

impl ClientArgs {
    fn keepalive(&self) -> Result<NextRoute> {
        let interval = Duration::from_secs(self.keepalive_interval);
        let timeout = Duration::from_secs(self.keepalive_timeout);
        if interval >= timeout {
            anyhow::bail!("--keepalive-interval must be shorter than --keepalive-timeout");
        }
        Ok(NextRoute::keepalive(KeepaliveClient::new(interval, timeout)))
    }

    fn forwarder(&self) -> Forwarder {
        Forwarder::new(Duration::from_secs(self.drain_delay))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon (HTTP surface and control channel on one port)
    Daemon {
        /// Address to listen on
        #[arg(short, long, default_value = DEFAULT_ADDR)]
        addr: String,

        /// Key clients must present
        #[arg(short, long, env = "EXPOSER_KEY")]
        key: Option<String>,

        /// Seconds without a ping before a client is dropped
        #[arg(long, default_value = "30")]
        keepalive_timeout: u64,

        /// Seconds to keep a forwarded connection open after one side finished
        #[arg(long, default_value = "8")]
        drain_delay: u64,
    },

    /// Expose a local TCP service under a name
    Expose {
        #[command(flatten)]
        server: ServerArgs,

        #[command(flatten)]
        tuning: ClientArgs,

        /// Service name
        #[arg(short, long)]
        name: String,

        /// Local address of the service, e.g. 127.0.0.1:8080
        #[arg(short, long)]
        addr: String,

        /// Make the service reachable through the daemon's HTTP gateway
        #[arg(long)]
        http: bool,

        /// Host header sent to the service by the HTTP gateway
        #[arg(long, requires = "http")]
        http_host: Option<String>,
    },

    /// Serve an exposed service on a local address
    Link {
        #[command(flatten)]
        server: ServerArgs,

        #[command(flatten)]
        tuning: ClientArgs,

        /// Service name
        #[arg(short, long)]
        name: String,

        /// Local address to listen on
        #[arg(short, long)]
        listen: String,
    },

    /// Serve an address reachable by the daemon on a local address
    Forward {
        #[command(flatten)]
        server: ServerArgs,

        #[command(flatten)]
        tuning: ClientArgs,

        /// Local address to listen on
        #[arg(short, long)]
        listen: String,

        /// Network the daemon dials (tcp, tcp4, tcp6)
        #[arg(long, default_value = "tcp")]
        network: String,

        /// Address the daemon dials
        #[arg(short, long)]
        address: String,

        /// Talk to a `forward-server` instead of a daemon (no key, no keepalive)
        #[arg(long)]
        direct: bool,
    },

    /// Run a standalone server that only forwards to network addresses
    ForwardServer {
        /// Address to listen on
        #[arg(short, long, default_value = DEFAULT_ADDR)]
        addr: String,

        /// Seconds to keep a forwarded connection open after one side finished
        #[arg(long, default_value = "8")]
        drain_delay: u64,
    },

    /// List services registered on the daemon
    Ls {
        #[command(flatten)]
        server: ServerArgs,
    },

    /// Manage stored defaults
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Set the default daemon URL
    SetServer { server: String },
    /// Set the default key
    SetKey { key: String },
    /// Show the stored defaults
    Show,
    /// Remove every stored default
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    // WebSocket and API clients use rustls
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Daemon {
            addr,
            key,
            keepalive_timeout,
            drain_delay,
        } => {
            let key = resolve(key, ConfigManager::load()?.key, "key")?;
            let mut config = DaemonConfig::new(addr, key);
            config.keepalive_timeout = Duration::from_secs(keepalive_timeout);
            config.drain_delay = Duration::from_secs(drain_delay);

            let daemon = Daemon::bind(config).await?;
            tokio::select! {
                result = daemon.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down daemon...");
                    Ok(())
                }
            }
        }
        Commands::Expose {
            server,
            tuning,
            name,
            addr,
            http,
            http_host,
        } => {
            let (server, key) = server.resolve()?;
            let attr = if http {
                Attribute::http(http_host.unwrap_or_default())
            } else {
                Attribute::default()
            };

            info!("Exposing {} as {:?}", addr, name);
            let routes = vec![
                tuning.keepalive()?,
                NextRoute::expose(name, attr, tcp_dialer(addr), tuning.forwarder()),
            ];
            client::run_routes(&server, &key, routes).await
        }
        Commands::Link {
            server,
            tuning,
            name,
            listen,
        } => {
            let (server, key) = server.resolve()?;
            let listener = TcpConnListener::bind(&listen).await?;
            info!("Serving {:?} on {}", name, listener.local_addr());

            let routes = vec![
                tuning.keepalive()?,
                NextRoute::link(name, Arc::new(listener), tuning.forwarder()),
            ];
            client::run_routes(&server, &key, routes).await
        }
        Commands::Forward {
            server,
            tuning,
            listen,
            network,
            address,
            direct,
        } => {
            if direct {
                let server = server.resolve_server()?;
                let listener = TcpConnListener::bind(&listen).await?;
                info!("Serving {} on {}", address, listener.local_addr());
                return client::run_direct_forward(
                    &server,
                    &network,
                    &address,
                    Arc::new(listener),
                    tuning.forwarder(),
                )
                .await;
            }

            let (server, key) = server.resolve()?;
            let listener = TcpConnListener::bind(&listen).await?;
            info!("Serving {} on {}", address, listener.local_addr());

            let routes = vec![
                tuning.keepalive()?,
                NextRoute::forward(network, address, Arc::new(listener), tuning.forwarder()),
            ];
            client::run_routes(&server, &key, routes).await
        }
        Commands::ForwardServer { addr, drain_delay } => {
            let relay = ForwardRelay::bind(&addr, Duration::from_secs(drain_delay)).await?;
            tokio::select! {
                result = relay.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down forward server...");
                    Ok(())
                }
            }
        }
        Commands::Ls { server } => {
            let (server, key) = server.resolve()?;
            let services = client::list_services(&server, &key).await?;
            print!("{}", client::format_services(&services));
            Ok(())
        }
        Commands::Config { command } => handle_config_command(command),
    }
}

fn handle_config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::SetServer { server } => {
            ConfigManager::set_server(server)?;
            println!("Server saved to {:?}", ConfigManager::get_config_path()?);
        }
        ConfigCommands::SetKey { key } => {
            ConfigManager::set_key(key)?;
            println!("Key saved to {:?}", ConfigManager::get_config_path()?);
        }
        ConfigCommands::Show => {
            let config = ConfigManager::load()?;
            println!("server: {}", config.server.as_deref().unwrap_or("(not set)"));
            println!(
                "key:    {}",
                if config.key.is_some() { "(set)" } else { "(not set)" }
            );
        }
        ConfigCommands::Clear => {
            ConfigManager::clear()?;
            println!("Stored defaults cleared");
        }
    }
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
