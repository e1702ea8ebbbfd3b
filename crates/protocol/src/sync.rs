//! File-push requests for the `sync:` service
//!
//! Only the subset needed to install the capture service is implemented:
//! `SEND`, `DATA`, `DONE` and the `OKAY`/`FAIL` status reply.
//!
//! ```text
//! SEND [len u32 LE] "<remote path>,<mode>"
//! DATA [len u32 LE] <chunk>        (repeated, chunk <= 64 KiB)
//! DONE [mtime u32 LE]
//! <- OKAY [0u32] | FAIL [len u32 LE] <message>
//! ```

use crate::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Largest DATA chunk accepted by the sync service
pub const SYNC_DATA_MAX: usize = 64 * 1024;

/// Encode a SEND request for `path` with unix `mode`
pub fn send_request(path: &str, mode: u32) -> Vec<u8> {
    let target = format!("{},{}", path, mode);
    request(b"SEND", target.as_bytes())
}

/// Encode a DATA chunk
pub fn data_chunk(chunk: &[u8]) -> Result<Vec<u8>> {
    if chunk.len() > SYNC_DATA_MAX {
        return Err(ProtocolError::PayloadTooLarge {
            size: chunk.len(),
            max: SYNC_DATA_MAX,
        });
    }
    Ok(request(b"DATA", chunk))
}

/// Encode the DONE marker with the file modification time
pub fn done(mtime: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(b"DONE");
    out.extend_from_slice(&mtime.to_le_bytes());
    out
}

fn request(id: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(id);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Status returned after DONE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Okay,
    Fail(String),
}

impl SyncStatus {
    /// Parse a status reply; `None` if more bytes are needed
    pub fn parse(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.len() < 8 {
            return Ok(None);
        }
        let len = LittleEndian::read_u32(&bytes[4..8]) as usize;
        match &bytes[0..4] {
            b"OKAY" => Ok(Some(SyncStatus::Okay)),
            b"FAIL" => {
                if bytes.len() < 8 + len {
                    return Ok(None);
                }
                let message = String::from_utf8_lossy(&bytes[8..8 + len]).into_owned();
                Ok(Some(SyncStatus::Fail(message)))
            }
            other => Err(ProtocolError::malformed(
                "sync status",
                format!("unexpected id {:?}", String::from_utf8_lossy(other)),
            )),
        }
    }
}
