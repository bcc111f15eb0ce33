//! `statehouse` binary: runs the server or pokes at a running one.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use statehouse::config::{Config, LogFormat};
use statehouse::network::{make_client_endpoint, make_server_endpoint, Channel, Network, RemoteTransport};
use statehouse::{telemetry, Client, ServerMeta, StateServer, SystemClock};

#[derive(Debug, Parser)]
#[command(name = "statehouse", version, about = "Shared-state server with atomic mutations and watches")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// More logging; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a server until interrupted.
    Serve {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        state_addr: Option<String>,
        #[arg(long)]
        watch_addr: Option<String>,
        #[arg(long)]
        max_frame_bytes: Option<usize>,
    },
    /// Ping a server's state channel.
    Ping { addr: SocketAddr },
    /// Print a namespace's document, or the value at PATH inside it.
    Get {
        addr: SocketAddr,
        namespace: String,
        path: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Command::Serve { config, .. } => config.clone(),
        _ => None,
    };
    let mut config = Config::load(config_path.as_deref())?;
    if cli.verbose > 0 {
        config.logging.verbosity = cli.verbose;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    telemetry::init(config.logging.verbosity, config.logging.format);

    match cli.command {
        Command::Serve {
            state_addr,
            watch_addr,
            max_frame_bytes,
            ..
        } => {
            if let Some(addr) = state_addr {
                config.state_address = addr;
            }
            if let Some(addr) = watch_addr {
                config.watch_address = addr;
            }
            if let Some(max) = max_frame_bytes {
                config.max_frame_bytes = max;
            }
            serve(config).await
        }
        Command::Ping { addr } => {
            let endpoint = make_client_endpoint()?;
            let transport = RemoteTransport::connect(&endpoint, addr, config.max_frame_bytes).await?;
            let client = Client::new(transport, "");
            let started = Instant::now();
            let pid = client.ping(b"ping".to_vec()).await?;
            println!("pong from pid {pid} in {:?}", started.elapsed());
            endpoint.close(0u32.into(), b"done");
            endpoint.wait_idle().await;
            Ok(())
        }
        Command::Get { addr, namespace, path } => {
            let endpoint = make_client_endpoint()?;
            let transport = RemoteTransport::connect(&endpoint, addr, config.max_frame_bytes).await?;
            let client = Client::new(transport, namespace.as_str());
            let value = match path {
                Some(path) => client.get(path.as_str()).await?,
                None => client.snapshot().await?,
            };
            println!("{value}");
            endpoint.close(0u32.into(), b"done");
            endpoint.wait_idle().await;
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let state_addr: SocketAddr = config
        .state_address
        .parse()
        .with_context(|| format!("invalid state address {:?}", config.state_address))?;
    let watch_addr: SocketAddr = config
        .watch_address
        .parse()
        .with_context(|| format!("invalid watch address {:?}", config.watch_address))?;

    let state_endpoint = make_server_endpoint(state_addr)?;
    let watch_endpoint = make_server_endpoint(watch_addr)?;
    let meta = ServerMeta::new(
        state_endpoint.local_addr()?.to_string(),
        watch_endpoint.local_addr()?.to_string(),
    );
    tracing::info!(state = %meta.state_address, watch = %meta.watch_address, "starting");

    let (handle, mut server_task) = StateServer::spawn(meta, SystemClock);
    tokio::spawn(Network::new(state_endpoint.clone(), Channel::State, handle.clone(), config.max_frame_bytes).run());
    tokio::spawn(Network::new(watch_endpoint.clone(), Channel::Watch, handle, config.max_frame_bytes).run());

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!("interrupted, shutting down");
            Ok(())
        }
        finished = &mut server_task => finished?.context("state server failed"),
    };

    state_endpoint.close(0u32.into(), b"shutdown");
    watch_endpoint.close(0u32.into(), b"shutdown");
    outcome
}
