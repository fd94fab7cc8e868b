//! Registry - credentials of every daemon the root daemon installed
//!
//! Append-only. The only in-place change is a port refresh on a credential
//! whose secret was just verified.

use crate::credential::Credential;
use crate::error::{DaeError, Result};

#[derive(Debug, Default)]
pub struct Registry {
    memory: Vec<Credential>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Credential> {
        self.memory.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.memory.iter()
    }

    /// Register an installed daemon.
    ///
    /// Fails on a credential without a name or secret, or whose secret is
    /// already registered.
    pub fn push(&mut self, credential: Credential) -> Result<()> {
        if credential.name.trim().is_empty() {
            return Err(DaeError::RegistryContractViolation(
                "credential has no name".into(),
            ));
        }

        let secret = match credential.secret() {
            Some(secret) if !secret.is_empty() => secret,
            _ => {
                return Err(DaeError::RegistryContractViolation(format!(
                    "credential '{}' has no secret",
                    credential.name
                )))
            }
        };

        if self.lookup_by_secret(secret).is_some() {
            return Err(DaeError::RegistryContractViolation(format!(
                "secret of '{}' is already registered",
                credential.name
            )));
        }

        self.memory.push(credential);
        Ok(())
    }

    /// Linear scan for the credential holding `secret`
    pub fn lookup_by_secret(&self, secret: &str) -> Option<&Credential> {
        self.memory.iter().find(|c| c.secret() == Some(secret))
    }

    pub fn lookup_by_secret_mut(&mut self, secret: &str) -> Option<&mut Credential> {
        self.memory.iter_mut().find(|c| c.secret() == Some(secret))
    }
}
