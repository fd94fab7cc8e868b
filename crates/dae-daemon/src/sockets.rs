//! Socket Table - listening sockets of the host
//!
//! The root daemon's scanner starts from this list. `Netstat` shells out
//! to `netstat -lntp`; tests plug in a fixed table instead.

use async_trait::async_trait;
use dae_core::Result;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// One row of the OS socket table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningSocket {
    pub protocol: String,
    pub local_address: String,
    pub port: Option<u16>,
    /// Unresolvable for processes the caller cannot introspect
    pub pid: Option<u32>,
    pub program: Option<String>,
}

impl ListeningSocket {
    pub fn new(port: u16, pid: Option<u32>) -> Self {
        Self {
            protocol: "tcp".to_string(),
            local_address: format!("127.0.0.1:{}", port),
            port: Some(port),
            pid,
            program: None,
        }
    }
}

/// Enumerates listening sockets
#[async_trait]
pub trait SocketTable: Send + Sync {
    async fn listening(&self) -> Result<Vec<ListeningSocket>>;
}

/// `netstat -lntp` backed table
#[derive(Debug, Clone, Default)]
pub struct Netstat;

#[async_trait]
impl SocketTable for Netstat {
    async fn listening(&self) -> Result<Vec<ListeningSocket>> {
        let output = Command::new("netstat")
            .arg("-lntp")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            debug!(code = ?output.status.code(), "netstat exited with failure");
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_netstat(&text))
    }
}

/// Parse `netstat -lntp` output.
///
/// ```text
/// Proto Recv-Q Send-Q Local Address    Foreign Address  State   PID/Program name
/// tcp        0      0 127.0.0.1:4000   0.0.0.0:*        LISTEN  1234/dae
/// tcp6       0      0 :::22            :::*             LISTEN  -
/// ```
///
/// Header lines and non-listening rows are skipped.
pub fn parse_netstat(text: &str) -> Vec<ListeningSocket> {
    text.lines().filter_map(parse_row).collect()
}

fn parse_row(line: &str) -> Option<ListeningSocket> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 || !fields[0].starts_with("tcp") || fields[5] != "LISTEN" {
        return None;
    }

    let local_address = fields[3];
    let port = local_address
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok());

    let (pid, program) = match fields.get(6).and_then(|f| f.split_once('/')) {
        Some((pid, program)) => (pid.parse().ok(), Some(program.to_string())),
        None => (None, None),
    };

    Some(ListeningSocket {
        protocol: fields[0].to_string(),
        local_address: local_address.to_string(),
        port,
        pid,
        program,
    })
}
