//! Credential - identity record of a daemon
//!
//! The secret is minted once by the root daemon at install time and handed
//! to the child only through its spawn configuration. The port is the only
//! field refreshed afterwards, and only after the secret has been verified.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identity of one daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    secret: Option<String>,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub created: u64,
    pub updated: u64,
}

impl Credential {
    /// Credential with a freshly minted secret, for a daemon about to be installed
    pub fn mint(name: impl Into<String>) -> Self {
        let secret = Uuid::new_v4().simple().to_string();
        Self::with_secret(name, Some(secret))
    }

    /// Credential carrying a secret handed down by a root daemon (or none)
    pub fn with_secret(name: impl Into<String>, secret: Option<String>) -> Self {
        let now = now_millis();
        Self {
            name: name.into(),
            secret,
            pid: None,
            port: None,
            created: now,
            updated: now,
        }
    }

    /// Snapshot of a running peer's own identity
    pub fn snapshot(name: &str, secret: Option<&str>, pid: u32, port: u16) -> Self {
        let mut credential = Self::with_secret(name, secret.map(str::to_string));
        credential.pid = Some(pid);
        credential.port = Some(port);
        credential
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    /// Record a port verified by a scan
    pub fn refresh_port(&mut self, port: u16) {
        self.port = Some(port);
        self.updated = now_millis();
    }

    /// String form of one field, used for case-insensitive lookups
    pub fn field(&self, field: CredentialField) -> Option<String> {
        match field {
            CredentialField::Name => Some(self.name.clone()),
            CredentialField::Secret => self.secret.clone(),
            CredentialField::Pid => self.pid.map(|p| p.to_string()),
            CredentialField::Port => self.port.map(|p| p.to_string()),
        }
    }

    /// Positional arguments of the legacy `credential` reply
    pub fn to_args(&self) -> Vec<Value> {
        vec![
            Value::from(self.name.clone()),
            self.pid.map(Value::from).unwrap_or(Value::Null),
            self.port.map(Value::from).unwrap_or(Value::Null),
            self.secret.clone().map(Value::from).unwrap_or(Value::Null),
        ]
    }
}

/// Selector for `get_daemons_by`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    Name,
    Secret,
    Pid,
    Port,
}

impl std::str::FromStr for CredentialField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "secret" => Ok(Self::Secret),
            "pid" => Ok(Self::Pid),
            "port" => Ok(Self::Port),
            other => Err(format!("unknown credential field '{}'", other)),
        }
    }
}

/// Structurally valid answer to a `dae` probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReply {
    pub name: String,
    pub pid: u32,
    pub port: u16,
    pub secret: String,
}

impl ProbeReply {
    /// Build from `credential` packet arguments `[name, pid, port, secret]`.
    /// Any missing, empty or zero field rejects the reply.
    pub fn from_args(args: &[Value]) -> Option<Self> {
        let name = args.first()?.as_str().filter(|s| !s.is_empty())?;
        let pid = args.get(1)?.as_u64().filter(|p| *p != 0)?;
        let port = args.get(2)?.as_u64().filter(|p| *p != 0)?;
        let secret = args.get(3)?.as_str().filter(|s| !s.is_empty())?;

        Some(Self {
            name: name.to_string(),
            pid: u32::try_from(pid).ok()?,
            port: u16::try_from(port).ok()?,
            secret: secret.to_string(),
        })
    }
}
