//! Installs the capture service binary through the `sync:` service

use crate::bridge::BridgeConnection;
use bytes::BytesMut;
use common::MirrorError;
use protocol::sync::{self, SYNC_DATA_MAX, SyncStatus};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Mode of the pushed file (regular file, rw-r--r--)
const PUSH_MODE: u32 = 0o100644;

/// Copy `local` to `remote_path` on the device
pub async fn push_service(
    connection: &BridgeConnection,
    local: &Path,
    remote_path: &str,
) -> Result<(), MirrorError> {
    let contents = tokio::fs::read(local)
        .await
        .map_err(|e| MirrorError::Io(format!("Failed to read {}: {}", local.display(), e)))?;
    info!(
        "Pushing {} ({} bytes) to {}",
        local.display(),
        contents.len(),
        remote_path
    );

    let mut stream = connection.open("sync:").await?;
    stream.write(&sync::send_request(remote_path, PUSH_MODE)).await?;
    for chunk in contents.chunks(SYNC_DATA_MAX) {
        stream.write(&sync::data_chunk(chunk)?).await?;
    }

    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    stream.write(&sync::done(mtime)).await?;

    let mut reply = BytesMut::new();
    let status = loop {
        if let Some(status) = SyncStatus::parse(&reply)? {
            break status;
        }
        match stream.read().await? {
            Some(data) => reply.extend_from_slice(&data),
            None => {
                return Err(MirrorError::CaptureServiceUnavailable(format!(
                    "sync service closed before confirming {}",
                    remote_path
                )));
            }
        }
    };
    stream.close();

    match status {
        SyncStatus::Okay => {
            debug!("Push of {} confirmed", remote_path);
            Ok(())
        }
        SyncStatus::Fail(message) => Err(MirrorError::CaptureServiceUnavailable(format!(
            "failed to push {}: {}",
            remote_path, message
        ))),
    }
}
