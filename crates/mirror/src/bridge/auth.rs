//! Host authentication responses
//!
//! The device may challenge the host with AUTH(TOKEN). The first challenge is
//! answered with a signature. A second challenge means the device does not
//! know the key, so the public key is offered for on-screen approval. A third
//! challenge means the user (or the device policy) declined.

use common::{HostKey, KeyError, MirrorError};
use std::sync::Arc;
use tracing::debug;

/// What to send in reply to an AUTH(TOKEN) challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    Signature(Vec<u8>),
    PublicKey(Vec<u8>),
    /// Nothing left to offer
    Exhausted,
}

/// Tracks how far host authentication has progressed
pub struct Authenticator {
    key: Arc<HostKey>,
    signatures_sent: u32,
    public_key_sent: bool,
}

impl Authenticator {
    pub fn new(key: Arc<HostKey>) -> Self {
        Self {
            key,
            signatures_sent: 0,
            public_key_sent: false,
        }
    }

    /// Next response to a device token
    pub fn respond(&mut self, token: &[u8]) -> Result<AuthStep, MirrorError> {
        if self.signatures_sent == 0 {
            let signature = self.key.sign_token(token).map_err(|e| match e {
                KeyError::InvalidToken(_) => MirrorError::ProtocolViolation(e.to_string()),
                other => MirrorError::Unauthorized(other.to_string()),
            })?;
            self.signatures_sent += 1;
            debug!("Answering auth token with signature");
            return Ok(AuthStep::Signature(signature));
        }

        if !self.public_key_sent {
            self.public_key_sent = true;
            debug!("Signature rejected, offering public key");
            return Ok(AuthStep::PublicKey(self.key.android_public_key()));
        }

        Ok(AuthStep::Exhausted)
    }

    /// Whether any challenge has been answered
    pub fn challenged(&self) -> bool {
        self.signatures_sent > 0
    }

    pub fn public_key_sent(&self) -> bool {
        self.public_key_sent
    }
}
