//! Peer - base behavior shared by every daemon
//!
//! Features:
//! - Binds a listening port (random start, walks upward while in use)
//! - Wraps each accepted connection in a Guest with baseline handlers
//!   (`whois`, `options`, `dae`) before the application sees it
//! - Client side: probe a port, ask the root daemon who is running,
//!   open a Guest to another daemon by name

use dae_core::{Credential, CredentialField, DaeConfig, DaeError, ProbeReply, Result, SpawnConfig};
use rand::Rng;
use serde_json::Value;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::guest::Guest;
use crate::probe::{self, PROBE_REPLY, PROBE_REQUEST};

/// Called for every accepted connection, after the baseline handlers are in place
pub type GuestHook = Arc<dyn Fn(&Guest) + Send + Sync>;

/// How to build a Peer
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub name: String,
    pub port: Option<u16>,
    pub spawn: Option<SpawnConfig>,
    pub config: DaeConfig,
}

impl PeerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: None,
            spawn: None,
            config: DaeConfig::default(),
        }
    }

    /// Preferred port; the next free one above it is used when taken
    pub fn port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn spawn(mut self, spawn: Option<SpawnConfig>) -> Self {
        self.spawn = spawn;
        self
    }

    pub fn config(mut self, config: DaeConfig) -> Self {
        self.config = config;
        self
    }
}

/// A running daemon with one listening socket
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    name: String,
    pid: u32,
    port: u16,
    spawn: Option<SpawnConfig>,
    config: DaeConfig,
    hooks: RwLock<Vec<GuestHook>>,
    shutdown: watch::Sender<bool>,
}

impl Peer {
    /// Bind the listener and start accepting connections
    pub async fn bind(options: PeerOptions) -> Result<Self> {
        let PeerOptions {
            name,
            port,
            spawn,
            config,
        } = options;

        debug!(name = %name, "Looking for available port");
        let listener = bind_available(&config, port).await?;
        let port = listener.local_addr()?.port();
        info!(name = %name, port, "Listening on {}:{}", config.bind_host, port);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(PeerInner {
            name,
            pid: std::process::id(),
            port,
            spawn,
            config,
            hooks: RwLock::new(Vec::new()),
            shutdown,
        });

        tokio::spawn(accept_loop(listener, Arc::downgrade(&inner), shutdown_rx));
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn config(&self) -> &DaeConfig {
        &self.inner.config
    }

    pub fn spawn_config(&self) -> Option<&SpawnConfig> {
        self.inner.spawn.as_ref()
    }

    /// This daemon's own identity
    pub fn credential(&self) -> Credential {
        Credential::snapshot(
            &self.inner.name,
            self.inner.spawn.as_ref().map(|s| s.secret.as_str()),
            self.inner.pid,
            self.inner.port,
        )
    }

    /// Attach application handlers to every new Guest
    pub fn on_guest<F>(&self, hook: F)
    where
        F: Fn(&Guest) + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(hook));
    }

    /// Stop accepting connections. Open Guests stay up until they close.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Send the raw `dae` probe to a port and read back its credential
    pub async fn connect(&self, port: u16) -> Result<Option<ProbeReply>> {
        probe::probe(&self.inner.config.bind_host, port, self.inner.config.probe_timeout()).await
    }

    /// Open a Guest to the root daemon this process was spawned by
    pub async fn connect_with_dae(&self) -> Result<Guest> {
        let spawn = self.inner.spawn.as_ref().ok_or(DaeError::NoParent)?;
        Guest::connect(
            (self.inner.config.bind_host.as_str(), spawn.parent_port),
            self.inner.config.probe_timeout(),
        )
        .await
    }

    /// Every daemon the root daemon currently verifies
    pub async fn list_daemons(&self) -> Result<Vec<Credential>> {
        let guest = self.connect_with_dae().await?;
        let daemons = fetch_daemons(&guest, self.inner.config.request_timeout()).await;
        if let Err(e) = guest.end().await {
            debug!("Closing root connection failed: {}", e);
        }
        daemons
    }

    /// Daemons whose `field` equals `value`, ignoring case
    pub async fn get_daemons_by(&self, field: CredentialField, value: &str) -> Result<Vec<Credential>> {
        let daemons = self.list_daemons().await?;
        Ok(filter_daemons(daemons, field, value))
    }

    pub async fn get_daemon_by_name(&self, name: &str) -> Result<Option<Credential>> {
        let mut daemons = self.get_daemons_by(CredentialField::Name, name).await?;
        Ok(if daemons.is_empty() {
            None
        } else {
            Some(daemons.swap_remove(0))
        })
    }

    /// Look a daemon up through the root daemon and open a Guest to it
    pub async fn connect_with(&self, daemon_name: &str) -> Result<Guest> {
        let credential = self
            .get_daemon_by_name(daemon_name)
            .await?
            .ok_or_else(|| DaeError::PeerNotFound(daemon_name.to_string()))?;

        let port = credential
            .port
            .ok_or_else(|| DaeError::PeerNotFound(format!("{} has no known port", daemon_name)))?;

        Guest::connect(
            (self.inner.config.bind_host.as_str(), port),
            self.inner.config.probe_timeout(),
        )
        .await
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        info!(name = %self.inner.name, "Connection from {}", addr);

        let guest = match Guest::wrap(stream) {
            Ok(guest) => guest,
            Err(e) => {
                warn!("Dropping connection from {}: {}", addr, e);
                return;
            }
        };

        self.install_baseline(&guest);

        let hooks = self
            .inner
            .hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for hook in hooks {
            hook(&guest);
        }

        guest.start();
    }

    fn install_baseline(&self, guest: &Guest) {
        let credential = self.credential();

        let snapshot = credential.clone();
        guest.on("whois", move |guest, _| {
            let snapshot = snapshot.clone();
            async move {
                match serde_json::to_value(&snapshot) {
                    Ok(value) => reply(&guest, PROBE_REPLY, vec![value]).await,
                    Err(e) => warn!("Cannot serialize credential: {}", e),
                }
            }
        });

        guest.on("options", |guest, _| async move {
            let commands = guest.listener_counts();
            match serde_json::to_value(commands) {
                Ok(value) => reply(&guest, "commands", vec![value]).await,
                Err(e) => warn!("Cannot serialize commands: {}", e),
            }
        });

        let args = credential.to_args();
        guest.on(PROBE_REQUEST, move |guest, _| {
            let args = args.clone();
            async move {
                reply(&guest, PROBE_REPLY, args).await;
                if let Err(e) = guest.end().await {
                    debug!(peer = %guest.peer_addr(), "Closing probe failed: {}", e);
                }
            }
        });
    }
}

/// Ask a root daemon, through an open Guest, for its verified daemons
pub async fn fetch_daemons(guest: &Guest, timeout: Duration) -> Result<Vec<Credential>> {
    let reply = guest.once("daemons");
    guest.send("list", vec![]).await?;

    let args = tokio::time::timeout(timeout, reply)
        .await
        .map_err(|_| DaeError::Timeout)?
        .map_err(|_| DaeError::ConnectionClosed)?;

    match args.into_iter().next() {
        Some(list) => Ok(serde_json::from_value(list)?),
        None => Ok(Vec::new()),
    }
}

/// Case-insensitive match on one credential field
pub fn filter_daemons(daemons: Vec<Credential>, field: CredentialField, value: &str) -> Vec<Credential> {
    let wanted = value.to_lowercase();
    daemons
        .into_iter()
        .filter(|c| c.field(field).is_some_and(|v| v.to_lowercase() == wanted))
        .collect()
}

/// Bind on the preferred port or a random one, walking upward past ports in use
pub async fn bind_available(config: &DaeConfig, preferred: Option<u16>) -> Result<TcpListener> {
    let start = match preferred {
        Some(port) if port >= config.port_range_start => port,
        _ => random_port(config),
    };

    let mut port = start;
    loop {
        match TcpListener::bind((config.bind_host.as_str(), port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!(port, "Port in use");
                port = port.checked_add(1).ok_or(DaeError::BindExhausted { start })?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn random_port(config: &DaeConfig) -> u16 {
    let span = config.port_range_span.max(1);
    config
        .port_range_start
        .saturating_add(rand::thread_rng().gen_range(0..span))
}

async fn reply(guest: &Guest, name: &str, args: Vec<Value>) {
    if let Err(e) = guest.send(name, args).await {
        warn!(peer = %guest.peer_addr(), "Reply '{}' failed: {}", name, e);
    }
}

async fn accept_loop(listener: TcpListener, peer: Weak<PeerInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let Some(inner) = peer.upgrade() else { break };
                    Peer { inner }.handle_connection(stream, addr);
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(port = listener.local_addr().map(|a| a.port()).unwrap_or_default(), "Listener closed");
}
