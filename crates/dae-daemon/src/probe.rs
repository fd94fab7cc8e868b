//! Probe - the lightweight `dae` handshake
//!
//! Connect, send a bare `dae` packet, half-close, and wait for the single
//! `credential` reply. Used by the root daemon's scanner to identify
//! listening sockets without a full Guest.

use dae_core::{decode_stream, encode, DaeError, ProbeReply, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use crate::guest::READ_BUFFER;

pub const PROBE_REQUEST: &str = "dae";
pub const PROBE_REPLY: &str = "credential";

/// Probe one port.
///
/// `Ok(None)` means something answered but not with a complete credential.
/// Silence for longer than `timeout` is `ProbeUnresponsive`.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> Result<Option<ProbeReply>> {
    let mut stream = time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| DaeError::ProbeUnresponsive { port })??;

    let request = encode(PROBE_REQUEST, &[])?;
    stream.write_all(&request).await?;
    stream.shutdown().await?;

    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = time::timeout(timeout, stream.read(&mut buf))
            .await
            .map_err(|_| DaeError::ProbeUnresponsive { port })??;

        if n == 0 {
            debug!(port, "Probe closed without reply");
            return Ok(None);
        }

        // Only the first packet counts
        if let Some(packet) = decode_stream(&buf[..n]).into_iter().next() {
            if packet.name != PROBE_REPLY {
                debug!(port, name = %packet.name, "Probe got unexpected reply");
                return Ok(None);
            }
            return Ok(ProbeReply::from_args(&packet.data));
        }
    }
}
