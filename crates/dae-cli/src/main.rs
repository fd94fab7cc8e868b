//! Dae CLI - run and query host-local daemons
//!
//! Commands:
//! - dae root            - Run the root daemon (installs and scans children)
//! - dae sample          - Run the Sample shared-memory daemon
//! - dae communication   - Run the Communication daemon
//! - dae list --port P   - Ask a root daemon for its verified daemons
//! - dae probe --port P  - Send the raw `dae` probe to a port
//! - dae config          - Show the effective configuration

mod samples;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dae_core::{get_config_path, load_config, CredentialField, SpawnConfig};
use dae_daemon::{
    fetch_daemons, filter_daemons, Guest, LocalSupervisor, Netstat, Peer, PeerOptions,
    ProcessSupervisor, RootDaemon, Target,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Dae - discovery and messaging for host-local daemons
#[derive(Parser)]
#[command(name = "dae", version, about = "Host-local daemon discovery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the root daemon until Ctrl-C
    Root {
        /// Preferred port (the next free one above it is used when taken)
        #[arg(short, long)]
        port: Option<u16>,
        /// Terminate every supervised daemon first
        #[arg(long)]
        reset: bool,
        /// Install a daemon, as NAME=PATH (repeatable)
        #[arg(short, long, value_name = "NAME=PATH")]
        install: Vec<String>,
        /// Install the Sample and Communication daemons from this binary
        #[arg(long)]
        samples: bool,
    },
    /// Run the Sample daemon (shared memory)
    Sample,
    /// Run the Communication daemon (writes into Sample every 3 seconds)
    Communication,
    /// List the daemons a root daemon has verified
    List {
        /// Root daemon port
        #[arg(short, long)]
        port: u16,
        /// Only show daemons with this name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Probe a port with the `dae` handshake
    Probe {
        #[arg(short, long)]
        port: u16,
    },
    /// Show config path and values
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Root {
            port,
            reset,
            install,
            samples: with_samples,
        } => run_root(port, reset, install, with_samples).await,
        Commands::Sample => samples::run_sample(child_peer(samples::SAMPLE).await?).await,
        Commands::Communication => {
            samples::run_communication(child_peer(samples::COMMUNICATION).await?).await
        }
        Commands::List { port, name } => list(port, name).await,
        Commands::Probe { port } => probe(port).await,
        Commands::Config => {
            let config = load_config()?;
            println!("Config: {}", get_config_path().display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn run_root(
    port: Option<u16>,
    reset: bool,
    install: Vec<String>,
    with_samples: bool,
) -> Result<()> {
    let mut config = load_config()?;
    if port.is_some() {
        config.root_port = port;
    }

    let mut installs = install
        .iter()
        .map(|spec| parse_install(spec))
        .collect::<Result<Vec<_>>>()?;

    let mut supervisor = LocalSupervisor::new();
    if with_samples {
        supervisor = supervisor
            .with_args(samples::SAMPLE, vec!["sample".into()])
            .with_args(samples::COMMUNICATION, vec!["communication".into()]);
    }
    let supervisor = Arc::new(supervisor);

    let root = RootDaemon::start(config, Arc::new(Netstat), supervisor.clone()).await?;
    println!("Dae listening on port {}", root.port());

    if reset {
        let terminated = root.reset().await?;
        println!("Reset: {} daemon(s) terminated", terminated);
    }

    if with_samples {
        let exe = std::env::current_exe().context("cannot locate the dae binary")?;
        installs.push((samples::SAMPLE.to_string(), exe.clone()));
        installs.push((samples::COMMUNICATION.to_string(), exe));
    }

    for (name, path) in installs {
        match root.install(&name, &path).await? {
            Some(_) => println!("Installed {} ({})", name, path.display()),
            None => println!("{} already running", name),
        }
    }

    tokio::signal::ctrl_c().await?;
    println!("Shutting down");

    root.shutdown();
    supervisor.terminate(Target::All).await?;
    Ok(())
}

/// Bind a child daemon, with the spawn configuration its root left in the environment
async fn child_peer(name: &str) -> Result<Peer> {
    let spawn = SpawnConfig::from_env();
    if spawn.is_none() {
        tracing::warn!("No spawn configuration found, {} runs without a root daemon", name);
    }

    let options = PeerOptions::new(name).spawn(spawn).config(load_config()?);
    Ok(Peer::bind(options).await?)
}

async fn list(port: u16, name: Option<String>) -> Result<()> {
    let config = load_config()?;
    let guest = Guest::connect((config.bind_host.as_str(), port), config.probe_timeout())
        .await
        .with_context(|| format!("no root daemon on port {}", port))?;

    let mut daemons = fetch_daemons(&guest, config.request_timeout()).await?;
    guest.end().await?;

    if let Some(name) = name {
        daemons = filter_daemons(daemons, CredentialField::Name, &name);
    }

    if daemons.is_empty() {
        println!("No daemons verified");
        return Ok(());
    }

    for daemon in daemons {
        let pid = daemon.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let port = daemon.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        println!("{:<20} pid {:<8} port {}", daemon.name, pid, port);
    }
    Ok(())
}

async fn probe(port: u16) -> Result<()> {
    let config = load_config()?;
    match dae_daemon::probe(&config.bind_host, port, config.probe_timeout()).await? {
        Some(reply) => println!(
            "{} (pid {}, port {}) answered with a credential",
            reply.name, reply.pid, reply.port
        ),
        None => println!("Port {} did not present a complete credential", port),
    }
    Ok(())
}

fn parse_install(spec: &str) -> Result<(String, PathBuf)> {
    let Some((name, path)) = spec.split_once('=') else {
        bail!("expected NAME=PATH, got '{}'", spec);
    };

    let name = name.trim();
    if name.is_empty() || path.trim().is_empty() {
        bail!("expected NAME=PATH, got '{}'", spec);
    }
    Ok((name.to_string(), PathBuf::from(path.trim())))
}
