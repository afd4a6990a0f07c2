//! SSH transport plumbing.
//!
//! ## Connection Lifecycle
//!
//! 1. **Address Parsing**: `host[:port]`, bracketed IPv6 (`[::1]:22`) or a
//!    bare IPv6 literal. The configured default port applies when none is given.
//! 2. **Client Configuration**: keepalive and compression settings. No
//!    inactivity timeout; every operation carries its own deadline.
//! 3. **Connection Establishment**: TCP dial and handshake bounded by the
//!    connect timeout; the host key is checked by the configured policy.
//! 4. **Authentication**: the credential's [`AuthChain`].
//!
//! ## Retry Strategy
//!
//! Dial attempts use exponential backoff with jitter (`backon`), starting at
//! the configured retry delay and capped at [`MAX_RETRY_DELAY`]. Host key
//! and authentication failures are never retried.
//!
//! ## Sub-channels
//!
//! [`exec_command`] opens one session channel per command and collects stdout
//! (`Data`) and stderr (`ExtendedData`, ext 1) until the exit status and EOF
//! arrive. [`open_sftp_file`] starts the `sftp` subsystem on its own channel
//! and creates the remote file.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::{ChannelMsg, client};
use russh_sftp::client::SftpSession;
use russh_sftp::client::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::auth::{AuthChain, AuthStrategy};
use super::config::{FleetConfig, MAX_RETRY_DELAY};
use super::deadline::Deadline;
use super::error::{CommandError, SessionError, TransferError};
use super::session::{CLOSE_GRACE, RemoteFile, SwitchClientHandler};
use super::trust::HostKeyPolicy;
use super::types::{CommandOutput, DeviceRecord};

/// Build the russh client configuration.
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Split a device address into host and port.
pub(crate) fn parse_address(address: &str, default_port: u16) -> Result<(String, u16), String> {
    let address = address.trim();
    if address.is_empty() {
        return Err("empty address".to_string());
    }

    // Bracketed IPv6, with or without port
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| "unterminated '[' in address".to_string())?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host.to_string(), parse_port(port)?)),
            None if tail.is_empty() => Ok((host.to_string(), default_port)),
            None => Err(format!("unexpected '{}' after IPv6 address", tail)),
        };
    }

    // Bare IPv6 literal has more than one colon and no port
    if address.matches(':').count() > 1 {
        return Ok((address.to_string(), default_port));
    }

    match address.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((address.to_string(), default_port)),
    }
}

fn parse_port(port: &str) -> Result<u16, String> {
    port.parse::<u16>()
        .map_err(|e| format!("Invalid port number: {}", e))
}

/// Dial and authenticate, retrying transient failures.
///
/// Returns the handle and the `user@host:port` peer label.
pub(crate) async fn connect_with_retry(
    device: &DeviceRecord,
    auth_chain: &AuthChain,
    config: &FleetConfig,
    policy: Arc<HostKeyPolicy>,
) -> Result<(client::Handle<SwitchClientHandler>, String), SessionError> {
    let (host, port) =
        parse_address(&device.address, config.default_port).map_err(|reason| {
            SessionError::Address {
                address: device.address.clone(),
                reason,
            }
        })?;
    let peer = format!("{}@{}:{}", device.username, host, port);
    let client_config = build_client_config(config.compression);
    let attempt_counter = AtomicU32::new(0);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(config.retry_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(config.max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
        if attempt > 0 {
            warn!("Connection retry attempt {} to {}", attempt, peer);
        }

        connect_once(
            &host,
            port,
            &device.username,
            auth_chain,
            client_config.clone(),
            policy.clone(),
            config.connect_timeout,
        )
        .await
    })
    .retry(backoff)
    .when(|e: &SessionError| e.is_retryable())
    .notify(|err, dur| {
        warn!("Connection to {} failed: {}. Retrying in {:?}", peer, err, dur);
    })
    .await;

    let attempts = attempt_counter.load(Ordering::SeqCst);
    match result {
        Ok(handle) => {
            if attempts > 1 {
                info!("Connected to {} after {} attempt(s)", peer, attempts);
            }
            Ok((handle, peer))
        }
        Err(e) => {
            error!(
                "Connection to {} failed after {} attempt(s): {}",
                peer, attempts, e
            );
            Err(e)
        }
    }
}

async fn connect_once(
    host: &str,
    port: u16,
    username: &str,
    auth_chain: &AuthChain,
    client_config: Arc<client::Config>,
    policy: Arc<HostKeyPolicy>,
    timeout: Duration,
) -> Result<client::Handle<SwitchClientHandler>, SessionError> {
    let address = format!("{}:{}", host, port);
    let rejected = Arc::new(AtomicBool::new(false));
    let handler = SwitchClientHandler::new(host, port, policy.clone(), rejected.clone());

    let connect = client::connect(client_config, (host, port), handler);
    let mut handle = match tokio::time::timeout(timeout, connect).await {
        Err(_) => {
            return Err(SessionError::Dial {
                address,
                reason: format!("Connection timed out after {:?}", timeout),
            });
        }
        Ok(Err(_)) if rejected.load(Ordering::SeqCst) => {
            return Err(SessionError::HostKeyRejected {
                address,
                policy: policy.name(),
            });
        }
        Ok(Err(e)) => {
            return Err(SessionError::Dial {
                address,
                reason: format!("Failed to connect: {}", e),
            });
        }
        Ok(Ok(handle)) => handle,
    };

    let authenticated = tokio::time::timeout(timeout, auth_chain.authenticate(&mut handle, username))
        .await
        .map_err(|_| SessionError::Auth {
            username: username.to_string(),
            reason: format!("no answer within {:?}", timeout),
        })?
        .map_err(|reason| SessionError::Auth {
            username: username.to_string(),
            reason,
        })?;

    if !authenticated {
        return Err(SessionError::Auth {
            username: username.to_string(),
            reason: "no authentication methods succeeded".to_string(),
        });
    }

    Ok(handle)
}

/// Run `command` on a new session channel and collect its output.
///
/// On interruption the partial output is kept and the channel is closed so
/// the transport stays usable for other tasks.
pub(crate) async fn exec_command(
    handle: &client::Handle<SwitchClientHandler>,
    command: &str,
    deadline: &Deadline,
) -> CommandOutput {
    let mut channel = match deadline.run(handle.channel_open_session()).await {
        Err(interrupted) => return CommandOutput::failed(CommandError::Interrupted(interrupted)),
        Ok(Err(e)) => return CommandOutput::failed(CommandError::Channel(e.to_string())),
        Ok(Ok(channel)) => channel,
    };

    if let Err(e) = channel.exec(true, command).await {
        let _ = tokio::time::timeout(CLOSE_GRACE, channel.close()).await;
        return CommandOutput::failed(CommandError::Channel(format!(
            "exec request failed: {}",
            e
        )));
    }

    let mut output = CommandOutput::default();
    let collected = deadline.run(collect_output(&mut channel, &mut output)).await;

    // Always close the channel so the session stays healthy
    let _ = tokio::time::timeout(CLOSE_GRACE, channel.close()).await;

    output.exit_err = match collected {
        Err(interrupted) => {
            warn!(
                "Command {} after {} bytes stdout, {} bytes stderr",
                interrupted,
                output.stdout.len(),
                output.stderr.len()
            );
            Some(CommandError::Interrupted(interrupted))
        }
        Ok(Some(0)) => None,
        Ok(Some(status)) => Some(CommandError::ExitStatus(status)),
        Ok(None) => Some(CommandError::NoExitStatus),
    };
    output
}

/// Read channel messages until the command finishes. Returns its exit status.
async fn collect_output(
    channel: &mut russh::Channel<client::Msg>,
    output: &mut CommandOutput,
) -> Option<u32> {
    let mut exit_status = None;
    let mut eof = false;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => output.stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                // ext == 1 is stderr in SSH protocol
                if ext == 1 {
                    output.stderr.extend_from_slice(&data);
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                exit_status = Some(status);
                if eof {
                    break;
                }
            }
            Some(ChannelMsg::Eof) => {
                eof = true;
                if exit_status.is_some() {
                    break;
                }
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    exit_status
}

/// Remote file on its own SFTP sub-channel.
struct SftpRemoteFile {
    file: Pin<Box<File>>,
    sftp: SftpSession,
}

#[async_trait]
impl RemoteFile for SftpRemoteFile {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), String> {
        self.file.write_all(buf).await.map_err(|e| e.to_string())
    }

    async fn close(mut self: Box<Self>) -> Result<(), String> {
        let flushed = self.file.shutdown().await.map_err(|e| e.to_string());
        if let Err(e) = self.sftp.close().await {
            debug!("Error closing SFTP sub-channel: {}", e);
        }
        flushed
    }
}

/// Start the SFTP subsystem on a new channel and create `remote_path`.
pub(crate) async fn open_sftp_file(
    handle: &client::Handle<SwitchClientHandler>,
    remote_path: &str,
) -> Result<Box<dyn RemoteFile>, TransferError> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| TransferError::Channel(e.to_string()))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| TransferError::Channel(format!("sftp subsystem: {}", e)))?;
    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| TransferError::Channel(format!("sftp init: {}", e)))?;

    match sftp.create(remote_path).await {
        Ok(file) => Ok(Box::new(SftpRemoteFile {
            file: Box::pin(file),
            sftp,
        })),
        Err(e) => {
            let _ = sftp.close().await;
            Err(TransferError::Create {
                path: remote_path.to_string(),
                reason: e.to_string(),
            })
        }
    }
}
