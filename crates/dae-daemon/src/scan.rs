//! Scan - discover, probe and verify installed daemons
//!
//! One scan cycle:
//! 1. keep listening sockets with a known pid and port that are not ours
//! 2. probe every candidate concurrently, each bounded by the probe timeout
//! 3. drop replies whose secret is not registered (not one of ours)
//! 4. drop replies whose name does not match the registered name (spoofed)
//! 5. refresh the port of everything that passed
//!
//! The registry is only touched in `verify`, which runs under the root
//! daemon's registry lock.

use dae_core::{Credential, DaeError, ProbeReply, Registry};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::probe::probe;
use crate::sockets::ListeningSocket;

/// Outcome of one scan cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    /// Registered credentials whose port was just refreshed
    pub verified: Vec<Credential>,
    /// Replies presenting a registered secret under the wrong name
    pub spoofed: Vec<ProbeReply>,
    /// Replies whose secret is not registered at all
    pub untrusted: usize,
}

/// Ports worth probing, sorted and without duplicates
pub fn select_candidates(sockets: &[ListeningSocket], own_pid: u32) -> Vec<u16> {
    let mut ports: Vec<u16> = sockets
        .iter()
        .filter(|s| s.pid.is_some_and(|pid| pid != own_pid))
        .filter_map(|s| s.port)
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Probe every port at once and wait for all of them.
/// A port that fails or stays silent contributes nothing.
pub async fn probe_all(host: &str, ports: &[u16], timeout: Duration) -> Vec<ProbeReply> {
    let mut probes = JoinSet::new();
    for &port in ports {
        let host = host.to_string();
        probes.spawn(async move { (port, probe(&host, port, timeout).await) });
    }

    let mut replies = Vec::new();
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((_, Ok(Some(reply)))) => replies.push(reply),
            Ok((port, Ok(None))) => debug!(port, "No credential from candidate"),
            Ok((port, Err(e))) => debug!(port, "Probe failed: {}", e),
            Err(e) => warn!("Probe task failed: {}", e),
        }
    }
    replies
}

/// Check replies against the registry and commit the ones that pass
pub fn verify(registry: &mut Registry, replies: Vec<ProbeReply>) -> ScanReport {
    let mut report = ScanReport::default();

    for reply in replies {
        let Some(credential) = registry.lookup_by_secret_mut(&reply.secret) else {
            let rejected = DaeError::UntrustedReply {
                name: reply.name.clone(),
                spoofed: false,
            };
            debug!(port = reply.port, "{}", rejected);
            report.untrusted += 1;
            continue;
        };

        if credential.name != reply.name {
            let rejected = DaeError::UntrustedReply {
                name: reply.name.clone(),
                spoofed: true,
            };
            warn!(
                claimed = %reply.name,
                registered = %credential.name,
                port = reply.port,
                "Copy cat detected: {}",
                rejected
            );
            report.spoofed.push(reply);
            continue;
        }

        credential.refresh_port(reply.port);
        report.verified.push(credential.clone());
    }

    report
}
