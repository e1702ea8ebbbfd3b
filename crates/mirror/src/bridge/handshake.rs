//! Connection handshake
//!
//! ```text
//! host   -> CNXN(version, max_payload, "host::features=...")
//! device -> CNXN(...)                        authorised, done
//!        |  AUTH(TOKEN)  -> AUTH(SIGNATURE)
//!        |  AUTH(TOKEN)  -> AUTH(RSAPUBLICKEY), wait for user approval
//!        |  AUTH(TOKEN)  -> rejected
//! ```

use crate::bridge::auth::{AuthStep, Authenticator};
use crate::bridge::engine::BridgeOptions;
use crate::usb::Transport;
use common::MirrorError;
use protocol::{
    AuthType, Command, ConnectionParams, DeviceBanner, Frame, FrameDecoder, HOST_VERSION,
    encode_frame, host_banner,
};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info};

/// Size of one transport read
pub(crate) const READ_CHUNK: usize = 64 * 1024;

/// Authentication milestones reported while connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// The device asked for a signature
    AuthChallenge,
    /// The device did not accept the signature
    SignatureRejected,
    /// The public key was sent; the user must approve it on the device
    AwaitingUserApproval,
}

/// Result of a completed handshake
#[derive(Debug, Clone)]
pub(crate) struct HandshakeOutcome {
    pub params: ConnectionParams,
    pub banner: DeviceBanner,
}

pub(crate) async fn perform_handshake(
    transport: &dyn Transport,
    decoder: &mut FrameDecoder,
    auth: &mut Authenticator,
    options: &BridgeOptions,
    progress: &(dyn Fn(HandshakeProgress) + Send + Sync),
) -> Result<HandshakeOutcome, MirrorError> {
    let hello = Frame::connect(HOST_VERSION, options.max_payload as u32, &host_banner());
    send_frame(transport, &hello).await?;

    let mut deadline = Instant::now() + options.handshake_timeout;
    loop {
        let frame = match timeout_at(deadline, next_frame(transport, decoder)).await {
            Ok(frame) => frame?,
            Err(_) => return Err(timeout_error(auth, options)),
        };

        match frame.command {
            Command::Cnxn => {
                let mut params = ConnectionParams::negotiate(frame.arg0, frame.arg1)?;
                params.max_payload = params.max_payload.min(options.max_payload);
                let banner = DeviceBanner::parse(&frame.payload_str());
                info!(
                    "Connected to {} (version {:#010x}, max payload {})",
                    banner.model().unwrap_or(&banner.system_type),
                    params.version,
                    params.max_payload
                );
                return Ok(HandshakeOutcome { params, banner });
            }
            Command::Auth => {
                if AuthType::try_from(frame.arg0)? != AuthType::Token {
                    return Err(MirrorError::ProtocolViolation(format!(
                        "device sent AUTH type {} instead of a token",
                        frame.arg0
                    )));
                }

                match auth.respond(&frame.payload)? {
                    AuthStep::Signature(signature) => {
                        progress(HandshakeProgress::AuthChallenge);
                        send_frame(transport, &Frame::auth(AuthType::Signature, signature)).await?;
                    }
                    AuthStep::PublicKey(public_key) => {
                        progress(HandshakeProgress::SignatureRejected);
                        send_frame(transport, &Frame::auth(AuthType::RsaPublicKey, public_key))
                            .await?;
                        progress(HandshakeProgress::AwaitingUserApproval);
                        deadline = Instant::now() + options.auth_timeout;
                    }
                    AuthStep::Exhausted => {
                        return Err(MirrorError::Unauthorized(
                            "device rejected the host key".to_string(),
                        ));
                    }
                }
            }
            other => debug!("Ignoring {} during handshake", other),
        }
    }
}

fn timeout_error(auth: &Authenticator, options: &BridgeOptions) -> MirrorError {
    if auth.public_key_sent() {
        MirrorError::Unauthorized(format!(
            "host key was not approved on the device within {:?}",
            options.auth_timeout
        ))
    } else if auth.challenged() {
        MirrorError::Unauthorized(format!(
            "no answer to the signature within {:?}",
            options.handshake_timeout
        ))
    } else {
        MirrorError::Io(format!(
            "device did not answer CNXN within {:?}",
            options.handshake_timeout
        ))
    }
}

async fn send_frame(transport: &dyn Transport, frame: &Frame) -> Result<(), MirrorError> {
    debug!("-> {}", frame);
    transport.write(encode_frame(frame)?).await?;
    Ok(())
}

async fn next_frame(
    transport: &dyn Transport,
    decoder: &mut FrameDecoder,
) -> Result<Frame, MirrorError> {
    loop {
        if let Some(frame) = decoder.next_frame()? {
            debug!("<- {}", frame);
            return Ok(frame);
        }
        let chunk = transport.read(READ_CHUNK).await?;
        decoder.extend(&chunk);
    }
}
