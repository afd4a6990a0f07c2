//! Device sessions.
//!
//! # Architecture
//!
//! - [`RemoteSession`]: one authenticated transport to a device. Sub-channels
//!   (a file transfer or a single command) are opened per operation and never
//!   reused. Implementations must allow concurrent sub-channels from many
//!   tasks through a shared reference.
//! - [`SessionConnector`]: dials a device and returns a `RemoteSession`.
//! - [`SshConnector`] / [`SshSession`]: the russh-backed implementations.
//! - [`SwitchClientHandler`]: russh client handler delegating host key checks
//!   to the configured [`HostKeyPolicy`].
//!
//! # Thread Safety
//!
//! `client::Handle` is not `Clone`; sessions are shared as
//! `Arc<dyn RemoteSession>` across the tasks of one orchestration run. Only
//! the owner of the run closes it, after every task has finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::{Disconnect, client, keys};
use tracing::{debug, info, warn};

use super::client::{connect_with_retry, exec_command, open_sftp_file};
use super::config::FleetConfig;
use super::deadline::Deadline;
use super::error::{SessionError, TransferError};
use super::secrets::Credential;
use super::trust::HostKeyPolicy;
use super::types::{CommandOutput, DeviceRecord};

/// Remote file opened for writing on a dedicated transfer sub-channel.
#[async_trait]
pub trait RemoteFile: Send {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), String>;

    /// Flush and release the remote handle and its sub-channel.
    async fn close(self: Box<Self>) -> Result<(), String>;
}

/// An authenticated transport to one device.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// `user@host:port` of the peer, for logs.
    fn peer(&self) -> &str;

    /// Create or truncate `remote_path` for writing.
    ///
    /// Channel setup failures map to `TransferError::Channel`, the create
    /// request itself to `TransferError::Create`.
    async fn create_file(&self, remote_path: &str) -> Result<Box<dyn RemoteFile>, TransferError>;

    /// Run one command on a fresh sub-channel, bounded by `deadline`.
    ///
    /// Failures are reported in `CommandOutput::exit_err`, never returned.
    async fn exec(&self, command: &str, deadline: &Deadline) -> CommandOutput;

    /// Release the transport. Safe to call more than once.
    async fn close(&self);
}

/// Opens sessions to registered devices.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn open(
        &self,
        device: &DeviceRecord,
        credential: &Credential,
    ) -> Result<Arc<dyn RemoteSession>, SessionError>;
}

/// russh client handler for switch connections.
pub struct SwitchClientHandler {
    host: String,
    port: u16,
    policy: Arc<HostKeyPolicy>,
    rejected: Arc<AtomicBool>,
}

impl SwitchClientHandler {
    /// `rejected` is set when the host key check fails, so the dial error can
    /// be reported as a trust failure rather than a network one.
    pub(crate) fn new(
        host: &str,
        port: u16,
        policy: Arc<HostKeyPolicy>,
        rejected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            policy,
            rejected,
        }
    }
}

impl client::Handler for SwitchClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let trusted = self.policy.verify(&self.host, self.port, server_public_key);
        if !trusted {
            self.rejected.store(true, Ordering::SeqCst);
        }
        Ok(trusted)
    }
}

/// Dials devices over SSH using the resolved configuration.
pub struct SshConnector {
    config: Arc<FleetConfig>,
    policy: Arc<HostKeyPolicy>,
}

impl SshConnector {
    pub fn new(config: Arc<FleetConfig>) -> Self {
        let policy = Arc::new(config.host_key_policy.clone());
        Self { config, policy }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn open(
        &self,
        device: &DeviceRecord,
        credential: &Credential,
    ) -> Result<Arc<dyn RemoteSession>, SessionError> {
        let (handle, peer) = connect_with_retry(
            device,
            &credential.auth_chain(),
            &self.config,
            self.policy.clone(),
        )
        .await?;

        info!("Session to {} ({}) established", device.name, peer);
        Ok(Arc::new(SshSession {
            peer,
            handle,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Grace period for closing channels and the transport.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A russh transport to one device.
pub struct SshSession {
    peer: String,
    handle: client::Handle<SwitchClientHandler>,
    closed: AtomicBool,
}

#[async_trait]
impl RemoteSession for SshSession {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn create_file(&self, remote_path: &str) -> Result<Box<dyn RemoteFile>, TransferError> {
        open_sftp_file(&self.handle, remote_path).await
    }

    async fn exec(&self, command: &str, deadline: &Deadline) -> CommandOutput {
        exec_command(&self.handle, command, deadline).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Session to {} already closed", self.peer);
            return;
        }

        let disconnect =
            self.handle
                .disconnect(Disconnect::ByApplication, "orchestration finished", "en");
        match tokio::time::timeout(CLOSE_GRACE, disconnect).await {
            Ok(Ok(())) => debug!("Session to {} closed", self.peer),
            Ok(Err(e)) => warn!("Error while disconnecting from {}: {}", self.peer, e),
            Err(_) => warn!("Disconnect from {} timed out", self.peer),
        }
    }
}
