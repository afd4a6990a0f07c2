//! Data model shared by the orchestration engine and the HTTP layer.
//!
//! Records that cross the HTTP boundary implement `Serialize`/`Deserialize`
//! with the field names the dashboard front end already consumes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CommandError, TaskError};

/// One registered switch.
///
/// `secret` is a reference resolved by a `SecretProvider`, never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub name: String,
    pub address: String,
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A script scheduled for one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptJob {
    /// Position in the script list, used for ordered output.
    pub index: usize,
    pub local_path: PathBuf,
    /// Absolute path the script is written to on the device.
    pub remote_path: String,
}

impl ScriptJob {
    /// Build a job whose remote path is `<remote_dir>/<prefix>-<basename>`.
    ///
    /// The random prefix keeps two jobs with the same basename apart when
    /// they run concurrently against one device.
    pub fn new(index: usize, local_path: impl Into<PathBuf>, remote_dir: &str) -> Self {
        let local_path = local_path.into();
        let prefix = Uuid::new_v4().simple().to_string();
        let remote_path = format!(
            "{}/{}-{}",
            remote_dir.trim_end_matches('/'),
            &prefix[..8],
            base_name(&local_path)
        );
        Self {
            index,
            local_path,
            remote_path,
        }
    }

    /// Display name of the script (its file name).
    pub fn name(&self) -> String {
        base_name(&self.local_path)
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "script".to_string())
}

/// Stage of a script task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Transfer,
    Execute,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Transfer => write!(f, "transfer"),
            Stage::Execute => write!(f, "execute"),
            Stage::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Script task state machine.
///
/// `Pending -> Uploaded -> Executed -> Cleaned -> Done`, with the failure
/// states absorbing from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Uploaded,
    Executed,
    Cleaned,
    Done,
    Failed(Stage),
    TimedOut(Stage),
    Cancelled(Stage),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            TaskState::Pending | TaskState::Uploaded | TaskState::Executed | TaskState::Cleaned
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Uploaded => write!(f, "uploaded"),
            TaskState::Executed => write!(f, "executed"),
            TaskState::Cleaned => write!(f, "cleaned"),
            TaskState::Done => write!(f, "done"),
            TaskState::Failed(stage) => write!(f, "failed during {}", stage),
            TaskState::TimedOut(stage) => write!(f, "timed out during {}", stage),
            TaskState::Cancelled(stage) => write!(f, "cancelled during {}", stage),
        }
    }
}

/// What happened to the remote copy of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// No remote file could have been created.
    Skipped,
    Removed,
    Failed(CommandError),
}

/// Captured output of one command run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Non-zero exit, missing status, channel failure or interruption.
    pub exit_err: Option<CommandError>,
}

impl CommandOutput {
    pub fn failed(err: CommandError) -> Self {
        Self {
            exit_err: Some(err),
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_err.is_none()
    }
}

/// Outcome of one script task; exactly one is produced per dispatched job.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub job: ScriptJob,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Furthest stage the task entered.
    pub stage: Stage,
    pub error: Option<TaskError>,
    pub cleanup: CleanupOutcome,
}

impl TaskResult {
    pub fn new(job: ScriptJob) -> Self {
        Self {
            job,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stage: Stage::Transfer,
            error: None,
            cleanup: CleanupOutcome::Skipped,
        }
    }

    /// Terminal state derived from the recorded error.
    pub fn state(&self) -> TaskState {
        match &self.error {
            None => TaskState::Done,
            Some(err) => err.terminal_state(self.stage),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Structured diagnostic record of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub temperature_sensors: Vec<String>,
    pub containers: Vec<String>,
    pub memory_types: Vec<String>,
    pub os_version: String,
    pub kernel_version: String,
    pub active_interfaces: String,
    pub sai_version: String,
    pub asic_type: String,
    /// Probes that failed and left their field empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probe_errors: Vec<String>,
    /// When the snapshot was taken (RFC3339 format)
    #[serde(default)]
    pub collected_at: String,
}

/// Response of `GET /registered_devices`
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisteredDevices {
    pub registered_devices: Vec<String>,
}

/// One Prometheus HTTP service-discovery target group
#[derive(Debug, Serialize, Deserialize)]
pub struct DiscoveryTargetGroup {
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}
