//! Process Supervisor - launches and terminates child daemons
//!
//! The root daemon only needs two operations from a supervisor: start an
//! executable with a spawn configuration, and terminate by name or all at
//! once. `LocalSupervisor` keeps the children of the current process.

use async_trait::async_trait;
use dae_core::{DaeError, Result, SpawnConfig};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    Started { pid: Option<u32> },
    /// A live process is already registered under that name
    AlreadyRunning,
}

/// Which supervised processes to terminate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Name(String),
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn start(&self, name: &str, executable: &Path, spawn: &SpawnConfig) -> Result<Launch>;

    /// Returns how many processes were signalled
    async fn terminate(&self, target: Target) -> Result<usize>;
}

/// Supervises children of the current process
#[derive(Default)]
pub struct LocalSupervisor {
    args: HashMap<String, Vec<String>>,
    children: Mutex<HashMap<String, Child>>,
}

impl LocalSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra command-line arguments for the daemon installed as `name`
    pub fn with_args(mut self, name: impl Into<String>, args: Vec<String>) -> Self {
        self.args.insert(name.into(), args);
        self
    }

    /// Names of children that are still alive
    pub async fn running(&self) -> Vec<String> {
        let mut children = self.children.lock().await;
        let mut names: Vec<String> = children
            .iter_mut()
            .filter_map(|(name, child)| is_alive(child).then(|| name.clone()))
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ProcessSupervisor for LocalSupervisor {
    async fn start(&self, name: &str, executable: &Path, spawn: &SpawnConfig) -> Result<Launch> {
        let mut children = self.children.lock().await;

        if let Some(child) = children.get_mut(name) {
            if is_alive(child) {
                return Ok(Launch::AlreadyRunning);
            }
        }

        let args = self.args.get(name).cloned().unwrap_or_default();
        let child = Command::new(executable)
            .args(&args)
            .envs(spawn.to_env())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DaeError::SupervisorUnavailable(format!("cannot start {:?}: {}", executable, e))
            })?;

        let pid = child.id();
        info!(name, pid = ?pid, "Started {:?}", executable);
        children.insert(name.to_string(), child);

        Ok(Launch::Started { pid })
    }

    async fn terminate(&self, target: Target) -> Result<usize> {
        let mut children = self.children.lock().await;

        let selected: Vec<String> = match target {
            Target::All => children.keys().cloned().collect(),
            Target::Name(name) => children.contains_key(&name).then_some(name).into_iter().collect(),
        };

        let mut signalled = 0;
        for name in selected {
            let Some(mut child) = children.remove(&name) else {
                continue;
            };

            if !is_alive(&mut child) {
                debug!(name = %name, "Already exited");
                continue;
            }

            match child.kill().await {
                Ok(()) => {
                    info!(name = %name, "Terminated");
                    signalled += 1;
                }
                Err(e) => warn!(name = %name, "Failed to terminate: {}", e),
            }
        }

        Ok(signalled)
    }
}

fn is_alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn spawn_config() -> SpawnConfig {
        SpawnConfig {
            parent_pid: std::process::id(),
            parent_port: 4000,
            secret: "s1".into(),
        }
    }

    fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("daemon.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_start_then_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(&dir, "sleep 30");
        let supervisor = LocalSupervisor::new();

        let launch = supervisor.start("Sample", &exe, &spawn_config()).await.unwrap();
        assert!(matches!(launch, Launch::Started { pid: Some(_) }));

        let again = supervisor.start("Sample", &exe, &spawn_config()).await.unwrap();
        assert_eq!(again, Launch::AlreadyRunning);
        assert_eq!(supervisor.running().await, vec!["Sample".to_string()]);

        assert_eq!(supervisor.terminate(Target::All).await.unwrap(), 1);
        assert!(supervisor.running().await.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_config_reaches_child_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let exe = script(
            &dir,
            &format!("echo \"$DAE $DAE_PORT $DAE_SECRET $1\" > {}", out.display()),
        );
        let supervisor = LocalSupervisor::new().with_args("Sample", vec!["sample".into()]);

        supervisor.start("Sample", &exe, &spawn_config()).await.unwrap();

        let mut content = String::new();
        for _ in 0..50 {
            content = std::fs::read_to_string(&out).unwrap_or_default();
            if content.ends_with('\n') {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(content.trim(), "1 4000 s1 sample");
    }

    #[tokio::test]
    async fn test_terminate_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(&dir, "sleep 30");
        let supervisor = LocalSupervisor::new();

        supervisor.start("A", &exe, &spawn_config()).await.unwrap();
        supervisor.start("B", &exe, &spawn_config()).await.unwrap();

        assert_eq!(supervisor.terminate(Target::Name("A".into())).await.unwrap(), 1);
        assert_eq!(supervisor.terminate(Target::Name("missing".into())).await.unwrap(), 0);
        assert_eq!(supervisor.running().await, vec!["B".to_string()]);

        supervisor.terminate(Target::All).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let supervisor = LocalSupervisor::new();
        let result = supervisor
            .start("Ghost", Path::new("/nonexistent/dae-ghost"), &spawn_config())
            .await;
        assert!(matches!(result, Err(DaeError::SupervisorUnavailable(_))));
    }
}
