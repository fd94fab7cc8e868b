//! In-memory collaborators for root daemon tests

use async_trait::async_trait;
use dae_core::{DaeError, Result, SpawnConfig};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::peer::{Peer, PeerOptions};
use crate::sockets::{ListeningSocket, SocketTable};
use crate::supervisor::{Launch, ProcessSupervisor, Target};

/// Pid reported for sockets of in-process daemons, so the scanner does not
/// skip them as its own
pub const FOREIGN_PID: u32 = u32::MAX - 1;

#[derive(Default)]
pub struct FixedSocketTable {
    sockets: Mutex<Vec<ListeningSocket>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FixedSocketTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn add_port(&self, port: u16) {
        self.sockets
            .lock()
            .unwrap()
            .push(ListeningSocket::new(port, Some(FOREIGN_PID)));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketTable for FixedSocketTable {
    async fn listening(&self) -> Result<Vec<ListeningSocket>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.sockets.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Bind an in-process Peer under the installed name and list its port
    Launch,
    AlreadyRunning,
    Unavailable,
}

/// Records every request and runs installed daemons as in-process Peers
pub struct FakeSupervisor {
    mode: Mode,
    table: Arc<FixedSocketTable>,
    pub launches: Mutex<Vec<(String, SpawnConfig)>>,
    pub terminations: Mutex<Vec<Target>>,
    peers: Mutex<Vec<Peer>>,
}

impl FakeSupervisor {
    pub fn new(mode: Mode, table: Arc<FixedSocketTable>) -> Arc<Self> {
        Arc::new(Self {
            mode,
            table,
            launches: Mutex::new(Vec::new()),
            terminations: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn peer(&self, name: &str) -> Option<Peer> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn start(&self, name: &str, _executable: &Path, spawn: &SpawnConfig) -> Result<Launch> {
        self.launches
            .lock()
            .unwrap()
            .push((name.to_string(), spawn.clone()));

        match self.mode {
            Mode::AlreadyRunning => Ok(Launch::AlreadyRunning),
            Mode::Unavailable => Err(DaeError::SupervisorUnavailable("offline".into())),
            Mode::Launch => {
                let peer = Peer::bind(PeerOptions::new(name).spawn(Some(spawn.clone()))).await?;
                self.table.add_port(peer.port());
                let pid = Some(peer.pid());
                self.peers.lock().unwrap().push(peer);
                Ok(Launch::Started { pid })
            }
        }
    }

    async fn terminate(&self, target: Target) -> Result<usize> {
        if self.mode == Mode::Unavailable {
            return Err(DaeError::SupervisorUnavailable("offline".into()));
        }
        self.terminations.lock().unwrap().push(target);

        let peers: Vec<Peer> = self.peers.lock().unwrap().drain(..).collect();
        for peer in &peers {
            peer.shutdown();
        }
        Ok(peers.len())
    }
}
