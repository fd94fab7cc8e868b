//! Sample daemons
//!
//! - Sample: shared memory other daemons can read and write
//! - Communication: finds Sample through the root daemon every few seconds
//!   and leaves a mark in its memory

use anyhow::Result;
use dae_core::credential::now_millis;
use dae_daemon::{Guest, Peer};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

pub const SAMPLE: &str = "Sample";
pub const COMMUNICATION: &str = "Communication";

const HEARTBEAT: Duration = Duration::from_secs(3);

/// Key/value store shared by every Guest of the Sample daemon
#[derive(Clone, Default)]
pub struct Memory {
    entries: Arc<Mutex<Map<String, Value>>>,
}

impl Memory {
    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Value {
        Value::Object(self.lock().clone())
    }

    pub fn set(&self, key: String, value: Value) {
        self.lock().insert(key, value);
    }

    pub fn get(&self, key: &str) -> Value {
        self.lock().get(key).cloned().unwrap_or(Value::Null)
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Serve `all`, `set`, `get` and `reset` on every connection to `peer`
    pub fn serve(&self, peer: &Peer) {
        let memory = self.clone();
        peer.on_guest(move |guest| {
            let m = memory.clone();
            guest.on("all", move |guest, _| {
                let snapshot = m.snapshot();
                async move { reply(&guest, "memory", vec![snapshot]).await }
            });

            let m = memory.clone();
            guest.on("set", move |_, args| {
                if let Some(key) = args.first().and_then(Value::as_str) {
                    let value = args.get(1).cloned().unwrap_or(Value::Null);
                    m.set(key.to_string(), value);
                }
                async {}
            });

            let m = memory.clone();
            guest.on("get", move |guest, args| {
                let key = args.first().and_then(Value::as_str).map(str::to_string);
                let value = key.as_deref().map(|k| m.get(k));
                async move {
                    if let (Some(key), Some(value)) = (key, value) {
                        reply(&guest, &key, vec![value]).await;
                    }
                }
            });

            let m = memory.clone();
            guest.on("reset", move |_, _| {
                m.reset();
                async {}
            });
        });
    }
}

/// Run the Sample daemon until Ctrl-C
pub async fn run_sample(peer: Peer) -> Result<()> {
    Memory::default().serve(&peer);

    match peer.list_daemons().await {
        Ok(daemons) => info!(count = daemons.len(), "Daemons installed"),
        Err(e) => warn!("Cannot list daemons: {}", e),
    }

    tokio::signal::ctrl_c().await?;
    peer.shutdown();
    Ok(())
}

/// Run the Communication daemon until Ctrl-C
pub async fn run_communication(peer: Peer) -> Result<()> {
    let mut ticker = tokio::time::interval(HEARTBEAT);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = heartbeat(&peer).await {
                    warn!("Heartbeat failed: {}", e);
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    peer.shutdown();
    Ok(())
}

async fn heartbeat(peer: &Peer) -> Result<()> {
    let guest = peer.connect_with(SAMPLE).await?;
    let memory = guest.once("memory");
    guest.send("all", vec![]).await?;

    let memory = tokio::time::timeout(peer.config().request_timeout(), memory).await??;
    let memory = Value::Array(memory);
    info!("Sample memory {}", memory);

    guest
        .send("set", vec![Value::from("communicationWasHere"), Value::from(now_millis())])
        .await?;
    guest.end().await?;
    Ok(())
}

async fn reply(guest: &Guest, name: &str, args: Vec<Value>) {
    if let Err(e) = guest.send(name, args).await {
        warn!(peer = %guest.peer_addr(), "Reply '{}' failed: {}", name, e);
    }
}
