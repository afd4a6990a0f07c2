//! Single-command execution on a fresh sub-channel.

use tracing::debug;

use super::deadline::Deadline;
use super::session::RemoteSession;
use super::types::CommandOutput;

/// Run `command` and capture its output.
///
/// Non-zero exits and transport failures land in `exit_err`; the caller
/// decides whether they matter.
pub async fn run(session: &dyn RemoteSession, command: &str, deadline: &Deadline) -> CommandOutput {
    debug!("Running '{}' on {}", command, session.peer());
    let output = session.exec(command, deadline).await;

    match &output.exit_err {
        None => debug!(
            "'{}' on {} finished ({} bytes stdout, {} bytes stderr)",
            command,
            session.peer(),
            output.stdout.len(),
            output.stderr.len()
        ),
        Some(e) => debug!("'{}' on {} {}", command, session.peer(), e),
    }
    output
}

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
