//! The per-script unit of work.
//!
//! ```text
//! Pending --upload--> Uploaded --execute--> Executed --cleanup--> Cleaned --> Done
//!    |                   |                     |
//!    +-> Failed/TimedOut/Cancelled(stage) <-----+
//! ```
//!
//! Cleanup runs whenever the remote file may exist: after a successful
//! upload, after any execute outcome, and after a transfer failure that got
//! as far as the create request. It runs under its own deadline that the
//! caller's cancellation does not reach, and is attempted exactly once.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::command::{self, shell_quote};
use super::config::FleetConfig;
use super::deadline::Deadline;
use super::error::{CommandError, TaskError, TransferError};
use super::session::RemoteSession;
use super::transfer;
use super::types::{CleanupOutcome, ScriptJob, Stage, TaskResult, TaskState};

/// Per-task tunables.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub privileged_shell: String,
    pub remove_command: String,
    /// Bound on upload and execution together.
    pub script_timeout: Duration,
    pub cleanup_timeout: Duration,
}

impl From<&FleetConfig> for TaskSettings {
    fn from(config: &FleetConfig) -> Self {
        Self {
            privileged_shell: config.privileged_shell.clone(),
            remove_command: config.remove_command.clone(),
            script_timeout: config.script_timeout,
            cleanup_timeout: config.cleanup_timeout,
        }
    }
}

/// Upload, execute and remove one script. Always returns a result.
pub async fn run_task(
    session: &dyn RemoteSession,
    job: ScriptJob,
    settings: &TaskSettings,
    cancel: &CancellationToken,
) -> TaskResult {
    let deadline = Deadline::after(settings.script_timeout, cancel.clone());
    let mut state = TaskState::Pending;
    let mut result = TaskResult::new(job);

    match transfer::upload(session, &result.job.local_path, &result.job.remote_path, &deadline)
        .await
    {
        Ok(_) => advance(&result.job, &mut state, TaskState::Uploaded),
        Err(e) => {
            let may_exist = e.may_have_created_remote();
            result.error = Some(transfer_failure(e));
            advance(&result.job, &mut state, result.state());
            if may_exist {
                result.stage = Stage::Cleanup;
                result.cleanup = cleanup(session, &result.job, settings).await;
            }
            return finish(result);
        }
    }

    result.stage = Stage::Execute;
    let exec = format!(
        "{} {}",
        settings.privileged_shell,
        shell_quote(&result.job.remote_path)
    );
    let output = command::run(session, &exec, &deadline).await;
    result.stdout = output.stdout;
    result.stderr = output.stderr;
    result.error = output.exit_err.map(|e| match e {
        CommandError::Interrupted(reason) => TaskError::Interrupted {
            stage: Stage::Execute,
            reason,
        },
        other => TaskError::Execute(other),
    });
    let executed = match result.error {
        None => TaskState::Executed,
        Some(_) => result.state(),
    };
    advance(&result.job, &mut state, executed);

    result.stage = Stage::Cleanup;
    result.cleanup = cleanup(session, &result.job, settings).await;
    if result.error.is_none() {
        advance(&result.job, &mut state, TaskState::Cleaned);
    }

    finish(result)
}

fn transfer_failure(err: TransferError) -> TaskError {
    match err {
        TransferError::Interrupted { reason, .. } => TaskError::Interrupted {
            stage: Stage::Transfer,
            reason,
        },
        other => TaskError::Transfer(other),
    }
}

/// Remove the remote script. The caller's cancellation does not apply here.
async fn cleanup(
    session: &dyn RemoteSession,
    job: &ScriptJob,
    settings: &TaskSettings,
) -> CleanupOutcome {
    let deadline = Deadline::uncancellable(settings.cleanup_timeout);
    let remove = format!("{} {}", settings.remove_command, shell_quote(&job.remote_path));
    let output = command::run(session, &remove, &deadline).await;

    match output.exit_err {
        None => CleanupOutcome::Removed,
        Some(e) => {
            warn!(
                "Failed to remove {} from {}: {}",
                job.remote_path,
                session.peer(),
                e
            );
            CleanupOutcome::Failed(e)
        }
    }
}

fn advance(job: &ScriptJob, state: &mut TaskState, next: TaskState) {
    debug!("Script {}: {} -> {}", job.name(), state, next);
    *state = next;
}

fn finish(result: TaskResult) -> TaskResult {
    match &result.error {
        None => debug!("Script {}: done", result.job.name()),
        Some(e) => warn!(
            "Script {} {}: {}",
            result.job.local_path.display(),
            result.state(),
            e
        ),
    }
    result
}
