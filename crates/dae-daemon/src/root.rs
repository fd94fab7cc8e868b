//! Root Daemon - installs child daemons and keeps track of where they listen
//!
//! Features:
//! - Everything a Peer does, under the name `Dae`
//! - Installs executables through a process supervisor, minting one secret each
//! - Periodic scan that verifies installed daemons and refreshes their ports
//! - Answers `list` with a fresh scan so clients can find each other

use dae_core::{Credential, DaeConfig, DaeError, Registry, Result, SpawnConfig};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::guest::Guest;
use crate::peer::{Peer, PeerOptions};
use crate::probe::PROBE_REPLY;
use crate::scan::{self, ScanReport};
use crate::sockets::SocketTable;
use crate::supervisor::{Launch, ProcessSupervisor, Target};

pub const ROOT_NAME: &str = "Dae";

/// The root of a daemon tree
pub struct RootDaemon {
    inner: Arc<RootInner>,
}

struct RootInner {
    peer: Peer,
    registry: Mutex<Registry>,
    /// Held for the whole of a scan; at most one runs at a time
    scan_gate: Mutex<()>,
    sockets: Arc<dyn SocketTable>,
    supervisor: Arc<dyn ProcessSupervisor>,
    scanner: StdMutex<Option<JoinHandle<()>>>,
}

impl RootDaemon {
    /// Bind the root daemon's port and start the periodic scan
    pub async fn start(
        config: DaeConfig,
        sockets: Arc<dyn SocketTable>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Result<Self> {
        let options = PeerOptions::new(ROOT_NAME)
            .port(config.root_port)
            .config(config);
        let peer = Peer::bind(options).await?;

        let inner = Arc::new(RootInner {
            peer,
            registry: Mutex::new(Registry::new()),
            scan_gate: Mutex::new(()),
            sockets,
            supervisor,
            scanner: StdMutex::new(None),
        });

        install_handlers(&inner);

        let scanner = spawn_scanner(&inner);
        *inner.scanner.lock().unwrap_or_else(|e| e.into_inner()) = scanner;

        info!(port = inner.peer.port(), "Root daemon started");
        Ok(Self { inner })
    }

    pub fn peer(&self) -> &Peer {
        &self.inner.peer
    }

    pub fn port(&self) -> u16 {
        self.inner.peer.port()
    }

    /// Snapshot of every installed daemon
    pub async fn credentials(&self) -> Vec<Credential> {
        self.inner.registry.lock().await.iter().cloned().collect()
    }

    /// Run a scan now, waiting for one in flight to finish first
    pub async fn scan(&self) -> Result<Vec<Credential>> {
        Ok(self.scan_report().await?.verified)
    }

    pub async fn scan_report(&self) -> Result<ScanReport> {
        self.inner.scan_now().await
    }

    /// Scan unless one is already in flight, in which case this is a no-op
    pub async fn try_scan(&self) -> Option<Result<ScanReport>> {
        self.inner.try_scan().await
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scan_gate.try_lock().is_err()
    }

    /// Launch `executable` as daemon `name` with a freshly minted secret.
    ///
    /// Returns the registered credential, or `None` when the supervisor
    /// reports the daemon as already running.
    pub async fn install(&self, name: &str, executable: &Path) -> Result<Option<Credential>> {
        if !executable.is_file() {
            return Err(DaeError::InvalidExecutable(executable.to_path_buf()));
        }

        let mut credential = Credential::mint(name);
        let secret = credential
            .secret()
            .ok_or_else(|| DaeError::RegistryContractViolation("minted credential has no secret".into()))?;
        let spawn = SpawnConfig {
            parent_pid: self.inner.peer.pid(),
            parent_port: self.inner.peer.port(),
            secret: secret.to_string(),
        };

        match self.inner.supervisor.start(name, executable, &spawn).await? {
            Launch::Started { pid } => {
                credential.pid = pid;
                self.inner.registry.lock().await.push(credential.clone())?;
                info!(name, pid = ?pid, "Installed {:?}", executable);
                Ok(Some(credential))
            }
            Launch::AlreadyRunning => {
                info!(name, "Already running");
                Ok(None)
            }
        }
    }

    pub async fn uninstall(&self, _name: &str) -> Result<()> {
        Err(DaeError::NotImplemented("uninstall"))
    }

    /// Terminate every supervised process. The registry is left as is.
    pub async fn reset(&self) -> Result<usize> {
        let terminated = self.inner.supervisor.terminate(Target::All).await?;
        info!(terminated, "Reset");
        Ok(terminated)
    }

    /// Stop the periodic scan and the listener
    pub fn shutdown(&self) {
        self.inner.stop();
    }
}

impl RootInner {
    async fn scan_now(&self) -> Result<ScanReport> {
        let _gate = self.scan_gate.lock().await;
        self.run_scan().await
    }

    async fn try_scan(&self) -> Option<Result<ScanReport>> {
        let Ok(_gate) = self.scan_gate.try_lock() else {
            debug!("Scan already in flight, skipping");
            return None;
        };
        Some(self.run_scan().await)
    }

    async fn run_scan(&self) -> Result<ScanReport> {
        let config = self.peer.config();
        let sockets = self.sockets.listening().await?;
        let candidates = scan::select_candidates(&sockets, self.peer.pid());
        debug!(candidates = candidates.len(), "Scanning");

        let replies = scan::probe_all(&config.bind_host, &candidates, config.probe_timeout()).await;

        let report = scan::verify(&mut *self.registry.lock().await, replies);
        info!(
            verified = report.verified.len(),
            spoofed = report.spoofed.len(),
            untrusted = report.untrusted,
            "Scan finished"
        );
        Ok(report)
    }

    fn stop(&self) {
        if let Some(scanner) = self.scanner.lock().unwrap_or_else(|e| e.into_inner()).take() {
            scanner.abort();
        }
        self.peer.shutdown();
    }
}

impl Drop for RootInner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn install_handlers(inner: &Arc<RootInner>) {
    let weak = Arc::downgrade(inner);

    inner.peer.on_guest(move |guest| {
        guest.on("whois", |guest, _| async move {
            send(&guest, "iam", vec![Value::from(ROOT_NAME)]).await;
        });

        let weak = weak.clone();
        guest.on("list", move |guest, _| {
            let weak = weak.clone();
            async move { answer_list(weak, guest).await }
        });
    });
}

async fn answer_list(root: Weak<RootInner>, guest: Guest) {
    let Some(root) = root.upgrade() else { return };

    let verified = match root.scan_now().await {
        Ok(report) => report.verified,
        Err(e) => {
            warn!("Scan for list failed: {}", e);
            Vec::new()
        }
    };
    drop(root);

    match serde_json::to_value(&verified) {
        Ok(list) => send(&guest, "daemons", vec![list]).await,
        Err(e) => {
            warn!("Cannot serialize daemons: {}", e);
            return;
        }
    }

    // Older clients read one credential packet per daemon
    for credential in &verified {
        send(&guest, PROBE_REPLY, credential.to_args()).await;
    }
}

async fn send(guest: &Guest, name: &str, args: Vec<Value>) {
    if let Err(e) = guest.send(name, args).await {
        warn!(peer = %guest.peer_addr(), "Reply '{}' failed: {}", name, e);
    }
}

fn spawn_scanner(inner: &Arc<RootInner>) -> Option<JoinHandle<()>> {
    let period = inner.peer.config().scan_interval();
    if period.is_zero() {
        info!("Periodic scan disabled");
        return None;
    }

    let root = Arc::downgrade(inner);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(root) = root.upgrade() else { break };

            match root.try_scan().await {
                Some(Ok(report)) => debug!(verified = report.verified.len(), "Periodic scan done"),
                Some(Err(e)) => error!("Periodic scan failed: {}", e),
                None => {}
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeSupervisor, FixedSocketTable, Mode};
    use dae_core::CredentialField;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn config() -> DaeConfig {
        DaeConfig {
            scan_interval_ms: 0,
            probe_timeout_ms: 300,
            ..DaeConfig::default()
        }
    }

    async fn root(mode: Mode) -> (RootDaemon, Arc<FixedSocketTable>, Arc<FakeSupervisor>) {
        root_with(config(), mode, FixedSocketTable::new()).await
    }

    async fn root_with(
        config: DaeConfig,
        mode: Mode,
        table: Arc<FixedSocketTable>,
    ) -> (RootDaemon, Arc<FixedSocketTable>, Arc<FakeSupervisor>) {
        let supervisor = FakeSupervisor::new(mode, Arc::clone(&table));
        let root = RootDaemon::start(config, table.clone(), supervisor.clone())
            .await
            .unwrap();
        (root, table, supervisor)
    }

    fn executable() -> tempfile::NamedTempFile {
        tempfile::NamedTempFile::new().unwrap()
    }

    #[tokio::test]
    async fn test_install_then_scan_verifies_child() {
        let (root, _, supervisor) = root(Mode::Launch).await;
        let exe = executable();

        let credential = root.install("Sample", exe.path()).await.unwrap().unwrap();
        let (name, spawn) = supervisor.launches.lock().unwrap()[0].clone();
        assert_eq!(name, "Sample");
        assert_eq!(Some(spawn.secret.as_str()), credential.secret());
        assert_eq!(spawn.parent_port, root.port());
        assert_eq!(spawn.parent_pid, std::process::id());

        let verified = root.scan().await.unwrap();
        let child = supervisor.peer("Sample").unwrap();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].name, "Sample");
        assert_eq!(verified[0].port, Some(child.port()));
        assert_eq!(root.credentials().await[0].port, Some(child.port()));
    }

    #[tokio::test]
    async fn test_spoofed_and_untrusted_replies() {
        let (root, table, _) = root(Mode::Launch).await;
        let exe = executable();
        let credential = root.install("Sample", exe.path()).await.unwrap().unwrap();
        let stolen = SpawnConfig {
            parent_pid: 1,
            parent_port: root.port(),
            secret: credential.secret().unwrap().to_string(),
        };

        let impostor = Peer::bind(PeerOptions::new("Impostor").spawn(Some(stolen)))
            .await
            .unwrap();
        table.add_port(impostor.port());

        let stranger_spawn = SpawnConfig {
            parent_pid: 1,
            parent_port: 1,
            secret: "somebody-elses".into(),
        };
        let stranger = Peer::bind(PeerOptions::new("Stranger").spawn(Some(stranger_spawn)))
            .await
            .unwrap();
        table.add_port(stranger.port());

        let report = root.scan_report().await.unwrap();
        assert_eq!(report.verified.len(), 1);
        assert_eq!(report.verified[0].name, "Sample");
        assert_eq!(report.spoofed.len(), 1);
        assert_eq!(report.spoofed[0].name, "Impostor");
        assert_eq!(report.untrusted, 1);

        let registered = root.credentials().await;
        assert_eq!(registered.len(), 1);
        assert_ne!(registered[0].port, Some(impostor.port()));
    }

    #[tokio::test]
    async fn test_silent_candidate_does_not_fail_scan() {
        let (root, table, _) = root(Mode::Launch).await;
        let exe = executable();
        root.install("A", exe.path()).await.unwrap();
        root.install("B", exe.path()).await.unwrap();

        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        table.add_port(silent.local_addr().unwrap().port());

        let verified = root.scan().await.unwrap();
        let mut names: Vec<_> = verified.iter().map(|c| c.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_scan_does_not_overlap() {
        let table = FixedSocketTable::with_delay(Duration::from_millis(200));
        let (root, table, _) = root_with(config(), Mode::Launch, table).await;
        let root = Arc::new(root);

        let first = {
            let root = Arc::clone(&root);
            tokio::spawn(async move { root.scan_report().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(root.is_scanning());
        assert!(root.try_scan().await.is_none());
        assert_eq!(table.calls(), 1);

        first.await.unwrap().unwrap();
        assert!(!root.is_scanning());
        assert!(root.try_scan().await.is_some());
        assert_eq!(table.calls(), 2);
    }

    #[tokio::test]
    async fn test_child_resolves_sibling_through_root() {
        let (root, _, supervisor) = root(Mode::Launch).await;
        let exe = executable();
        root.install("Sample", exe.path()).await.unwrap();
        root.install("Communication", exe.path()).await.unwrap();

        let communication = supervisor.peer("Communication").unwrap();
        let sample = supervisor.peer("Sample").unwrap();

        let daemons = communication.list_daemons().await.unwrap();
        assert_eq!(daemons.len(), 2);

        let found = communication.get_daemon_by_name("sample").await.unwrap().unwrap();
        assert_eq!(found.port, Some(sample.port()));

        let by_port = communication
            .get_daemons_by(CredentialField::Port, &sample.port().to_string())
            .await
            .unwrap();
        assert_eq!(by_port.len(), 1);

        let guest = communication.connect_with("Sample").await.unwrap();
        let reply = guest.once("credential");
        guest.send("whois", vec![]).await.unwrap();
        let args = tokio::time::timeout(TIMEOUT, reply).await.unwrap().unwrap();
        assert_eq!(args[0]["name"], "Sample");

        assert!(matches!(
            communication.connect_with("Missing").await,
            Err(DaeError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_sends_legacy_credentials() {
        let (root, _, supervisor) = root(Mode::Launch).await;
        let exe = executable();
        root.install("Sample", exe.path()).await.unwrap();
        let sample = supervisor.peer("Sample").unwrap();

        let guest = Guest::connect(("127.0.0.1", root.port()), TIMEOUT).await.unwrap();
        let daemons = guest.once("daemons");
        let legacy = guest.once("credential");
        guest.send("list", vec![]).await.unwrap();

        let daemons = tokio::time::timeout(TIMEOUT, daemons).await.unwrap().unwrap();
        assert_eq!(daemons[0][0]["name"], "Sample");

        let legacy = tokio::time::timeout(TIMEOUT, legacy).await.unwrap().unwrap();
        assert_eq!(legacy[0], "Sample");
        assert_eq!(legacy[2], sample.port());
    }

    #[tokio::test]
    async fn test_whois_answers_iam() {
        let (root, _, _) = root(Mode::Launch).await;
        let guest = Guest::connect(("127.0.0.1", root.port()), TIMEOUT).await.unwrap();

        let iam = guest.once("iam");
        let credential = guest.once("credential");
        guest.send("whois", vec![]).await.unwrap();

        let iam = tokio::time::timeout(TIMEOUT, iam).await.unwrap().unwrap();
        assert_eq!(iam, vec![Value::from("Dae")]);

        let credential = tokio::time::timeout(TIMEOUT, credential).await.unwrap().unwrap();
        assert_eq!(credential[0]["name"], "Dae");
        assert!(credential[0]["secret"].is_null());
    }

    #[tokio::test]
    async fn test_already_running_is_not_registered() {
        let (root, _, supervisor) = root(Mode::AlreadyRunning).await;
        let exe = executable();

        assert_eq!(root.install("Sample", exe.path()).await.unwrap(), None);
        assert_eq!(supervisor.launch_count(), 1);
        assert!(root.credentials().await.is_empty());
    }

    #[tokio::test]
    async fn test_supervisor_failure_reaches_caller() {
        let (root, _, _) = root(Mode::Unavailable).await;
        let exe = executable();

        assert!(matches!(
            root.install("Sample", exe.path()).await,
            Err(DaeError::SupervisorUnavailable(_))
        ));
        assert!(matches!(root.reset().await, Err(DaeError::SupervisorUnavailable(_))));
        assert!(root.credentials().await.is_empty());
    }

    #[tokio::test]
    async fn test_install_rejects_missing_executable() {
        let (root, _, supervisor) = root(Mode::Launch).await;
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            root.install("Sample", &dir.path().join("missing")).await,
            Err(DaeError::InvalidExecutable(_))
        ));
        assert!(matches!(
            root.install("Sample", dir.path()).await,
            Err(DaeError::InvalidExecutable(_))
        ));
        assert_eq!(supervisor.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_install_records_launched_pid() {
        let (root, _, supervisor) = root(Mode::Launch).await;
        let exe = executable();

        let credential = root.install("Sample", exe.path()).await.unwrap().unwrap();
        let pid = supervisor.peer("Sample").unwrap().pid();
        assert_eq!(credential.pid, Some(pid));
        assert_eq!(root.credentials().await[0].pid, Some(pid));

        let verified = root.scan().await.unwrap();
        assert_eq!(verified[0].pid, Some(pid));

        let sample = supervisor.peer("Sample").unwrap();
        let by_pid = sample
            .get_daemons_by(CredentialField::Pid, &pid.to_string())
            .await
            .unwrap();
        assert_eq!(by_pid.len(), 1);
        assert_eq!(by_pid[0].name, "Sample");
    }

    #[tokio::test]
    async fn test_reset_keeps_registry() {
        let (root, _, supervisor) = root(Mode::Launch).await;
        let exe = executable();
        root.install("Sample", exe.path()).await.unwrap();

        assert_eq!(root.reset().await.unwrap(), 1);
        assert_eq!(supervisor.terminations.lock().unwrap().as_slice(), &[Target::All]);
        assert_eq!(root.credentials().await.len(), 1);
    }

    #[tokio::test]
    async fn test_uninstall_not_implemented() {
        let (root, _, _) = root(Mode::Launch).await;
        assert!(matches!(
            root.uninstall("Sample").await,
            Err(DaeError::NotImplemented(_))
        ));
    }

    #[tokio::test]
    async fn test_periodic_scan_refreshes_ports() {
        let config = DaeConfig {
            scan_interval_ms: 50,
            ..config()
        };
        let (root, table, supervisor) = root_with(config, Mode::Launch, FixedSocketTable::new()).await;
        let exe = executable();
        root.install("Sample", exe.path()).await.unwrap();
        let port = supervisor.peer("Sample").unwrap().port();

        let mut refreshed = None;
        for _ in 0..40 {
            refreshed = root.credentials().await[0].port;
            if refreshed.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(refreshed, Some(port));

        root.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let calls = table.calls();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(table.calls(), calls);
    }
}
