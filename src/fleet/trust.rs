//! Host key verification policies.
//!
//! The policy is chosen by configuration and consulted by the SSH client
//! handler during the handshake:
//!
//! - `known-hosts`: the key must already be listed for the host and port in
//!   an OpenSSH known_hosts file. Unknown and changed keys are rejected.
//! - `fingerprint`: the key's SHA-256 fingerprint must be one of a pinned set.
//! - `insecure`: any key is accepted. Only ever used when selected explicitly.

use std::collections::BTreeSet;
use std::path::PathBuf;

use russh::keys::{self, HashAlg, PublicKey};
use tracing::{debug, warn};

use super::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    KnownHosts(PathBuf),
    Pinned(BTreeSet<String>),
    Insecure,
}

impl HostKeyPolicy {
    /// Build a policy from its configured name.
    ///
    /// `fingerprints` is a comma-separated list, only used by `fingerprint`.
    pub fn from_parts(
        policy: &str,
        known_hosts: PathBuf,
        fingerprints: &str,
    ) -> Result<Self, ConfigError> {
        match policy.trim().to_ascii_lowercase().as_str() {
            "known-hosts" | "known_hosts" => Ok(HostKeyPolicy::KnownHosts(known_hosts)),
            "fingerprint" | "pinned" => {
                let pinned: BTreeSet<String> = fingerprints
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect();
                if pinned.is_empty() {
                    return Err(ConfigError::NoPinnedFingerprints);
                }
                Ok(HostKeyPolicy::Pinned(pinned))
            }
            "insecure" => Ok(HostKeyPolicy::Insecure),
            other => Err(ConfigError::UnknownHostKeyPolicy(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostKeyPolicy::KnownHosts(_) => "known-hosts",
            HostKeyPolicy::Pinned(_) => "fingerprint",
            HostKeyPolicy::Insecure => "insecure",
        }
    }

    /// Decide whether `key` is trusted for `host:port`.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        let fingerprint = fingerprint(key);
        match self {
            HostKeyPolicy::KnownHosts(path) => {
                match keys::check_known_hosts_path(host, port, key, path) {
                    Ok(true) => {
                        debug!("Host key {} for {}:{} found in {:?}", fingerprint, host, port, path);
                        true
                    }
                    Ok(false) => {
                        warn!(
                            "Host key {} for {}:{} is not in {:?}",
                            fingerprint, host, port, path
                        );
                        false
                    }
                    Err(e) => {
                        warn!(
                            "Host key {} for {}:{} rejected: {}",
                            fingerprint, host, port, e
                        );
                        false
                    }
                }
            }
            HostKeyPolicy::Pinned(pinned) => {
                let trusted = pinned.contains(&fingerprint);
                if !trusted {
                    warn!(
                        "Host key {} for {}:{} does not match any pinned fingerprint",
                        fingerprint, host, port
                    );
                }
                trusted
            }
            HostKeyPolicy::Insecure => {
                warn!(
                    "Accepting unverified host key {} for {}:{} (insecure policy)",
                    fingerprint, host, port
                );
                true
            }
        }
    }
}

/// OpenSSH-style `SHA256:...` fingerprint of a public key.
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}
