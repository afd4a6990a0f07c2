//! Credential resolution for registered devices.
//!
//! The device list stores a secret *reference* per device rather than the
//! secret itself. A [`SecretProvider`] turns that reference into a
//! [`Credential`] at dial time:
//!
//! | Reference | Credential |
//! |-----------|------------|
//! | `env:NAME` | password read from environment variable `NAME` |
//! | `file:PATH` | password read from `PATH` (trailing newline stripped) |
//! | `key:PATH` | private key file at `PATH` |
//! | anything else | inline password, only if inline secrets are allowed |

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::{debug, warn};

use super::auth::{AuthChain, AuthStrategy};
use super::error::SecretError;
use super::session::SwitchClientHandler;
use super::types::DeviceRecord;

/// A resolved credential for one device.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    KeyFile(PathBuf),
}

impl Credential {
    /// Authentication chain that presents this credential.
    pub fn auth_chain(&self) -> AuthChain {
        AuthChain::new().with(self.clone())
    }
}

/// A credential authenticates itself: passwords directly, key files by
/// loading the (passphrase-less) private key and signing with the strongest
/// RSA hash the device offers.
#[async_trait]
impl AuthStrategy for Credential {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SwitchClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let outcome = match self {
            Credential::Password(password) => {
                handle.authenticate_password(username, password).await
            }
            Credential::KeyFile(path) => {
                let key = keys::load_secret_key(path, None)
                    .map_err(|e| format!("cannot load key {}: {}", path.display(), e))?;
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                debug!("Signing with {} (RSA hash {:?})", path.display(), hash_alg);
                handle
                    .authenticate_publickey(
                        username,
                        keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
            }
        };

        outcome
            .map(|result| result.success())
            .map_err(|e| format!("{} authentication failed: {}", self.name(), e))
    }

    fn name(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::KeyFile(_) => "key",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => write!(f, "Password(<redacted>)"),
            Credential::KeyFile(path) => write!(f, "KeyFile({:?})", path),
        }
    }
}

/// Resolves a device's secret reference into a credential.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn resolve(&self, device: &DeviceRecord) -> Result<Credential, SecretError>;
}

/// Default provider understanding `env:`, `file:` and `key:` references.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSecretProvider {
    allow_inline: bool,
}

impl ReferenceSecretProvider {
    pub fn new(allow_inline: bool) -> Self {
        Self { allow_inline }
    }
}

#[async_trait]
impl SecretProvider for ReferenceSecretProvider {
    async fn resolve(&self, device: &DeviceRecord) -> Result<Credential, SecretError> {
        let reference = device.secret.trim();

        if let Some(name) = reference.strip_prefix("env:") {
            let value =
                std::env::var(name).map_err(|_| SecretError::MissingEnv(name.to_string()))?;
            return non_empty(reference, value).map(Credential::Password);
        }

        if let Some(path) = reference.strip_prefix("file:") {
            let raw = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| SecretError::ReadFile {
                    path: path.to_string(),
                    reason: e.to_string(),
                })?;
            let value = raw.trim_end_matches(['\r', '\n']).to_string();
            return non_empty(reference, value).map(Credential::Password);
        }

        if let Some(path) = reference.strip_prefix("key:") {
            if path.is_empty() {
                return Err(SecretError::Empty(reference.to_string()));
            }
            return Ok(Credential::KeyFile(PathBuf::from(path)));
        }

        if !self.allow_inline {
            return Err(SecretError::InlineRejected(device.name.clone()));
        }

        warn!(
            "Device '{}' uses an inline secret from the device list",
            device.name
        );
        non_empty("<inline>", device.secret.clone()).map(Credential::Password)
    }
}

fn non_empty(reference: &str, value: String) -> Result<String, SecretError> {
    if value.is_empty() {
        Err(SecretError::Empty(reference.to_string()))
    } else {
        Ok(value)
    }
}
