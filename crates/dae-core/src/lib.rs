//! Dae Core - identity and wire format for host-local daemons
//!
//! Features:
//! - Packet codec (`<name> <json args>`, no length prefix)
//! - Credentials with secrets minted at install time
//! - Registry of installed daemons, keyed on secret
//! - Configuration (tuning file + spawn-time settings)
//! - One error type for the whole workspace

pub mod config;
pub mod credential;
pub mod error;
pub mod packet;
pub mod registry;

pub use config::{load_config, save_config, get_config_path, DaeConfig, SpawnConfig};
pub use credential::{Credential, CredentialField, ProbeReply};
pub use error::{DaeError, Result};
pub use packet::{decode, decode_stream, encode, Packet, SEPARATOR};
pub use registry::Registry;
