//! Copying a local script onto a device.

use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::deadline::{Deadline, Interrupted};
use super::error::TransferError;
use super::session::{CLOSE_GRACE, RemoteFile, RemoteSession};

/// Bytes read from the local file per remote write.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Copy `local_path` to `remote_path` on the session's device.
///
/// The remote file is always closed, also when the copy fails. Returns the
/// number of bytes written.
pub async fn upload(
    session: &dyn RemoteSession,
    local_path: &Path,
    remote_path: &str,
    deadline: &Deadline,
) -> Result<u64, TransferError> {
    let mut local = File::open(local_path)
        .await
        .map_err(|e| TransferError::LocalOpen {
            path: local_path.display().to_string(),
            reason: e.to_string(),
        })?;

    deadline.check().map_err(|reason| TransferError::Interrupted {
        reason,
        remote_touched: false,
    })?;

    // From here on the remote file may exist
    let mut remote = deadline
        .run(session.create_file(remote_path))
        .await
        .map_err(touched)??;

    let copied = copy(&mut local, remote.as_mut(), local_path, remote_path, deadline).await;

    let bytes = match copied {
        Ok(bytes) => bytes,
        Err(e) => {
            match tokio::time::timeout(CLOSE_GRACE, remote.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(close_err)) => {
                    warn!("Closing {} after failed upload: {}", remote_path, close_err)
                }
                Err(_) => warn!("Closing {} after failed upload timed out", remote_path),
            }
            return Err(e);
        }
    };

    deadline
        .run(remote.close())
        .await
        .map_err(touched)?
        .map_err(|reason| TransferError::Close {
            path: remote_path.to_string(),
            reason,
        })?;

    debug!(
        "Uploaded {} bytes from {} to {}:{}",
        bytes,
        local_path.display(),
        session.peer(),
        remote_path
    );
    Ok(bytes)
}

async fn copy(
    local: &mut File,
    remote: &mut dyn RemoteFile,
    local_path: &Path,
    remote_path: &str,
    deadline: &Deadline,
) -> Result<u64, TransferError> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = deadline
            .run(local.read(&mut buf))
            .await
            .map_err(touched)?
            .map_err(|e| TransferError::LocalRead {
                path: local_path.display().to_string(),
                reason: e.to_string(),
            })?;
        if n == 0 {
            return Ok(total);
        }

        deadline
            .run(remote.write_all(&buf[..n]))
            .await
            .map_err(touched)?
            .map_err(|reason| TransferError::Write {
                path: remote_path.to_string(),
                reason,
            })?;
        total += n as u64;
    }
}

fn touched(reason: Interrupted) -> TransferError {
    TransferError::Interrupted {
        reason,
        remote_touched: true,
    }
}
