//! Error types for the orchestration engine.
//!
//! Errors fall into three groups:
//!
//! 1. **Fatal to the request** ([`OrchestrationError`]): the device is unknown,
//!    the registry or script list cannot be read, the secret cannot be
//!    resolved, or the session cannot be established. Nothing has run yet.
//!
//! 2. **Fatal to one task** ([`TaskError`]): transfer, execution or
//!    interruption of a single script. Reported inline in that script's result
//!    block; sibling tasks are unaffected.
//!
//! 3. **Degraded field**: a failed diagnostic probe (see `inspector`), which
//!    only empties the matching snapshot field.
//!
//! Dial errors are additionally classified by [`is_retryable_error`] so the
//! session manager retries transient network failures but never bad
//! credentials.

use thiserror::Error;

use super::deadline::Interrupted;
use super::types::{Stage, TaskState};

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "authentication rejected",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "host key",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
];

/// Determines if a dial error message describes a transient failure.
///
/// Authentication and host key failures are checked first and are never
/// retryable. Known network failures are retryable. Anything else is retried
/// unless it looks like an SSH protocol error.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return false;
    }

    if RETRYABLE_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return true;
    }

    !error_lower.contains("ssh") || error_lower.contains("connect")
}

/// Failure to establish a session with a device.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("invalid device address '{address}': {reason}")]
    Address { address: String, reason: String },

    #[error("failed to reach {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("host key for {address} rejected by {policy} policy")]
    HostKeyRejected {
        address: String,
        policy: &'static str,
    },

    #[error("authentication as '{username}' failed: {reason}")]
    Auth { username: String, reason: String },
}

impl SessionError {
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            SessionError::Dial { reason, .. } => is_retryable_error(reason),
            _ => false,
        }
    }
}

/// Failure while copying a script to the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("failed to open local script {path}: {reason}")]
    LocalOpen { path: String, reason: String },

    #[error("failed to read local script {path}: {reason}")]
    LocalRead { path: String, reason: String },

    #[error("failed to open file transfer channel: {0}")]
    Channel(String),

    #[error("failed to create remote file {path}: {reason}")]
    Create { path: String, reason: String },

    #[error("failed to write remote file {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("failed to close remote file {path}: {reason}")]
    Close { path: String, reason: String },

    #[error("upload {reason}")]
    Interrupted {
        reason: Interrupted,
        /// Whether the remote create request had been sent.
        remote_touched: bool,
    },
}

impl TransferError {
    /// Whether a (possibly partial) remote file may exist after this failure.
    ///
    /// Once the create request is sent the file may exist, even if the create
    /// reply was an error or never arrived.
    pub fn may_have_created_remote(&self) -> bool {
        match self {
            TransferError::LocalOpen { .. } | TransferError::Channel(_) => false,
            TransferError::Create { .. }
            | TransferError::LocalRead { .. }
            | TransferError::Write { .. }
            | TransferError::Close { .. } => true,
            TransferError::Interrupted { remote_touched, .. } => *remote_touched,
        }
    }
}

/// Failure reported by a command run. Callers decide the severity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("failed to open command channel: {0}")]
    Channel(String),

    #[error("exited with status {0}")]
    ExitStatus(u32),

    #[error("exited without reporting a status")]
    NoExitStatus,

    #[error("command {0}")]
    Interrupted(Interrupted),
}

/// Why one script task did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("transfer failed: {0}")]
    Transfer(TransferError),

    #[error("execution failed: {0}")]
    Execute(CommandError),

    #[error("{stage} {reason}")]
    Interrupted { stage: Stage, reason: Interrupted },

    #[error("task aborted: {0}")]
    Aborted(String),
}

impl TaskError {
    pub(crate) fn terminal_state(&self, stage: Stage) -> TaskState {
        match self {
            TaskError::Transfer(_) => TaskState::Failed(Stage::Transfer),
            TaskError::Execute(_) => TaskState::Failed(Stage::Execute),
            TaskError::Interrupted {
                stage,
                reason: Interrupted::TimedOut,
            } => TaskState::TimedOut(*stage),
            TaskError::Interrupted {
                stage,
                reason: Interrupted::Cancelled,
            } => TaskState::Cancelled(*stage),
            TaskError::Aborted(_) => TaskState::Failed(stage),
        }
    }
}

/// Failure to load the device registry.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("failed to read device list {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("device list line {line}: expected 4 columns, found {columns}")]
    MalformedRow { line: usize, columns: usize },
}

/// Failure to load the script list.
#[derive(Debug, Clone, Error)]
pub enum ScriptListError {
    #[error("failed to read script list {path}: {reason}")]
    Read { path: String, reason: String },
}

/// Failure to resolve a device credential.
#[derive(Debug, Clone, Error)]
pub enum SecretError {
    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("failed to read secret file {path}: {reason}")]
    ReadFile { path: String, reason: String },

    #[error("secret reference '{0}' resolves to an empty value")]
    Empty(String),

    #[error("device '{0}' has an inline secret and inline secrets are disabled")]
    InlineRejected(String),
}

/// Invalid configuration detected at startup.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("unknown host key policy '{0}' (expected known-hosts, fingerprint or insecure)")]
    UnknownHostKeyPolicy(String),

    #[error("host key policy 'fingerprint' requires at least one pinned fingerprint")]
    NoPinnedFingerprints,
}

/// Failures that abort a request before any script runs.
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    #[error("device '{0}' is not registered")]
    UnknownDevice(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Scripts(#[from] ScriptListError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("inspection of '{device}' did not finish: {reason}")]
    Inspection { device: String, reason: String },
}
