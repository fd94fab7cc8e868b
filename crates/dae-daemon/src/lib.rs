//! Dae Daemon - discovery and messaging between host-local daemons
//!
//! Features:
//! - Guest: one TCP connection, packets dispatched to local handlers in order
//! - Peer: a daemon with one listening port and an identity
//! - RootDaemon: installs children, scans the socket table, rejects impostors
//! - Collaborators: OS socket table (netstat) and process supervisor

pub mod guest;
pub mod peer;
pub mod probe;
pub mod root;
pub mod scan;
pub mod sockets;
pub mod supervisor;

#[cfg(test)]
mod test_utils;

pub use guest::{Guest, PACKET_EVENT};
pub use peer::{fetch_daemons, filter_daemons, Peer, PeerOptions};
pub use probe::probe;
pub use root::{RootDaemon, ROOT_NAME};
pub use scan::ScanReport;
pub use sockets::{parse_netstat, ListeningSocket, Netstat, SocketTable};
pub use supervisor::{Launch, LocalSupervisor, ProcessSupervisor, Target};
