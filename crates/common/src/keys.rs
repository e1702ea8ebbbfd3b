//! Host authentication key
//!
//! The device bridge authenticates hosts with an RSA-2048 key pair. The
//! device sends a random 20-byte token; the host answers with a PKCS#1 v1.5
//! signature over that token, treated as a SHA-1 digest. A device that does
//! not yet trust the key is then sent the public key in the Android key
//! format so the user can approve it on screen.
//!
//! Keys are stored as PKCS#8 PEM in XDG-compliant locations:
//! - Linux: `~/.config/usb-mirror/adbkey`
//! - macOS: `~/Library/Application Support/usb-mirror/adbkey`
//! - Windows: `%APPDATA%\usb-mirror\adbkey`

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Application name for XDG directory lookup
const APP_NAME: &str = "usb-mirror";

/// Key filename
const KEY_FILENAME: &str = "adbkey";

/// Modulus size in bits
pub const KEY_BITS: usize = 2048;

/// Length of the authentication token sent by the device
pub const TOKEN_LEN: usize = 20;

const MODULUS_WORDS: usize = KEY_BITS / 32;

/// DER prefix of a SHA-1 DigestInfo
const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Failed to generate key: {0}")]
    Generate(String),

    #[error("Failed to sign token: {0}")]
    Sign(String),

    #[error("Invalid token length: expected {TOKEN_LEN} bytes, got {0}")]
    InvalidToken(usize),

    #[error("Unsupported key size: {0} bits")]
    UnsupportedKeySize(usize),

    #[error("Invalid key file {path}: {reason}")]
    InvalidKeyFile { path: PathBuf, reason: String },

    #[error("Key file I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to determine config directory (HOME not set?)")]
    NoConfigDir,
}

/// The host's RSA key pair
#[derive(Clone)]
pub struct HostKey {
    private: RsaPrivateKey,
}

impl std::fmt::Debug for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKey")
            .field("bits", &(self.private.size() * 8))
            .finish_non_exhaustive()
    }
}

impl HostKey {
    /// Generate a new key from the operating system's secure RNG
    pub fn generate() -> Result<Self, KeyError> {
        let private = RsaPrivateKey::new(&mut OsRng, KEY_BITS)
            .map_err(|e| KeyError::Generate(e.to_string()))?;
        Ok(Self { private })
    }

    /// Wrap an existing private key
    pub fn from_private_key(private: RsaPrivateKey) -> Result<Self, KeyError> {
        let bits = private.size() * 8;
        if bits != KEY_BITS {
            return Err(KeyError::UnsupportedKeySize(bits));
        }
        Ok(Self { private })
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private.to_public_key()
    }

    /// Sign a device token
    pub fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>, KeyError> {
        if token.len() != TOKEN_LEN {
            return Err(KeyError::InvalidToken(token.len()));
        }
        let mut digest_info = Vec::with_capacity(SHA1_DIGEST_INFO.len() + TOKEN_LEN);
        digest_info.extend_from_slice(&SHA1_DIGEST_INFO);
        digest_info.extend_from_slice(token);

        self.private
            .sign(Pkcs1v15Sign::new_unprefixed(), &digest_info)
            .map_err(|e| KeyError::Sign(e.to_string()))
    }

    /// Public key payload for an AUTH(RSAPUBLICKEY) frame
    ///
    /// Base64 of the Android binary key, a space, `user@host`, and a NUL.
    pub fn android_public_key(&self) -> Vec<u8> {
        let encoded = STANDARD.encode(encode_android_key(&self.public_key()));
        let mut out = format!("{} {}", encoded, key_comment()).into_bytes();
        out.push(0);
        out
    }

    /// Serialize as PKCS#8 PEM
    pub fn to_pem(&self) -> Result<String, KeyError> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| KeyError::Generate(e.to_string()))
    }

    /// Load a key from a PKCS#8 PEM file
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        debug!("Loading host key from {}", path.display());

        let pem = fs::read_to_string(path).map_err(|source| KeyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let private =
            RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| KeyError::InvalidKeyFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let key = Self::from_private_key(private).map_err(|e| KeyError::InvalidKeyFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        info!("Loaded host key from {}", path.display());
        Ok(key)
    }

    /// Save the key with owner-only permissions
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn save(&self, path: &Path) -> Result<(), KeyError> {
        debug!("Saving host key to {}", path.display());
        let io_err = |source| KeyError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let pem = self.to_pem()?;
        let mut file = File::create(path).map_err(io_err)?;
        file.write_all(pem.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            if let Err(e) = fs::set_permissions(path, permissions) {
                warn!(
                    "Failed to set secure permissions on {}: {}",
                    path.display(),
                    e
                );
            }
        }

        info!("Saved host key to {}", path.display());
        Ok(())
    }

    /// Load the key at `path` (or the default path), generating it if absent
    pub fn load_or_generate(path: Option<&Path>) -> Result<Self, KeyError> {
        let key_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_key_path()?,
        };

        if key_path.exists() {
            Self::load(&key_path)
        } else {
            let key = Self::generate()?;
            key.save(&key_path)?;
            info!("Generated new host key at {}", key_path.display());
            Ok(key)
        }
    }
}

/// Default host key path using XDG conventions
pub fn default_key_path() -> Result<PathBuf, KeyError> {
    let config_dir = dirs::config_dir().ok_or(KeyError::NoConfigDir)?;
    Ok(config_dir.join(APP_NAME).join(KEY_FILENAME))
}

fn key_comment() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| APP_NAME.to_string());
    format!("{}@{}", user, host)
}

/// Android binary public key:
///
/// ```text
/// [len u32 = 64][n0inv u32][n: 256 bytes][rr: 256 bytes][e u32]
/// ```
///
/// All values little-endian. `n0inv = -1 / n mod 2^32`,
/// `rr = 2^4096 mod n`.
pub fn encode_android_key(public: &RsaPublicKey) -> Vec<u8> {
    let n = public.n();
    let n_bytes = n.to_bytes_le();
    let rr = (BigUint::from(1u32) << (KEY_BITS * 2)) % n;

    let mut n0 = [0u8; 4];
    for (dst, src) in n0.iter_mut().zip(n_bytes.iter()) {
        *dst = *src;
    }
    let n0inv = mod_inverse_u32(u32::from_le_bytes(n0)).wrapping_neg();

    let exponent = public
        .e()
        .to_bytes_le()
        .iter()
        .take(4)
        .enumerate()
        .fold(0u32, |acc, (i, b)| acc | (u32::from(*b) << (8 * i)));

    let mut out = Vec::with_capacity(8 + 2 * (KEY_BITS / 8) + 4);
    out.extend_from_slice(&(MODULUS_WORDS as u32).to_le_bytes());
    out.extend_from_slice(&n0inv.to_le_bytes());
    out.extend_from_slice(&padded_le(&n_bytes));
    out.extend_from_slice(&padded_le(&rr.to_bytes_le()));
    out.extend_from_slice(&exponent.to_le_bytes());
    out
}

fn padded_le(bytes: &[u8]) -> [u8; KEY_BITS / 8] {
    let mut out = [0u8; KEY_BITS / 8];
    let len = bytes.len().min(out.len());
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Inverse of an odd value modulo 2^32 (Newton iteration)
fn mod_inverse_u32(value: u32) -> u32 {
    let mut inv = value;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(value.wrapping_mul(inv)));
    }
    inv
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use tempfile::TempDir;

    fn test_key() -> &'static HostKey {
        static KEY: OnceLock<HostKey> = OnceLock::new();
        KEY.get_or_init(|| HostKey::generate().unwrap())
    }

    #[test]
    fn test_mod_inverse() {
        for value in [1u32, 3, 65537, 0xffff_ffff, 0x1234_5679] {
            assert_eq!(value.wrapping_mul(mod_inverse_u32(value)), 1);
        }
    }

    #[test]
    fn test_signature_verifies() {
        let key = test_key();
        let token = [7u8; TOKEN_LEN];
        let signature = key.sign_token(&token).unwrap();
        assert_eq!(signature.len(), KEY_BITS / 8);

        let mut digest_info = SHA1_DIGEST_INFO.to_vec();
        digest_info.extend_from_slice(&token);
        key.public_key()
            .verify(Pkcs1v15Sign::new_unprefixed(), &digest_info, &signature)
            .unwrap();
    }

    #[test]
    fn test_sign_rejects_wrong_token_length() {
        assert!(matches!(
            test_key().sign_token(&[0u8; 16]),
            Err(KeyError::InvalidToken(16))
        ));
    }

    #[test]
    fn test_android_key_layout() {
        let key = test_key();
        let public = key.public_key();
        let raw = encode_android_key(&public);
        assert_eq!(raw.len(), 524);
        assert_eq!(u32::from_le_bytes(raw[0..4].try_into().unwrap()), 64);

        let n0inv = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        let n0 = u32::from_le_bytes(raw[8..12].try_into().unwrap());
        assert_eq!(n0.wrapping_mul(n0inv), u32::MAX);

        assert_eq!(BigUint::from_bytes_le(&raw[8..264]), *public.n());
        let exponent = u32::from_le_bytes(raw[520..524].try_into().unwrap());
        assert_eq!(exponent, 65537);
    }

    #[test]
    fn test_android_public_key_payload() {
        let payload = test_key().android_public_key();
        assert_eq!(payload.last(), Some(&0));

        let text = std::str::from_utf8(&payload[..payload.len() - 1]).unwrap();
        let (encoded, comment) = text.split_once(' ').unwrap();
        assert!(comment.contains('@'));
        assert_eq!(STANDARD.decode(encoded).unwrap().len(), 524);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join("nested").join("adbkey");

        test_key().save(&key_path).unwrap();
        let loaded = HostKey::load(&key_path).unwrap();
        assert_eq!(loaded.public_key(), test_key().public_key());
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join("adbkey");

        let first = HostKey::load_or_generate(Some(&key_path)).unwrap();
        assert!(key_path.exists());
        let second = HostKey::load_or_generate(Some(&key_path)).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_load_invalid_key_file() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join("adbkey");
        fs::write(&key_path, b"not a pem").unwrap();

        assert!(matches!(
            HostKey::load(&key_path),
            Err(KeyError::InvalidKeyFile { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join("adbkey");
        test_key().save(&key_path).unwrap();

        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_default_key_path() {
        if let Ok(path) = default_key_path() {
            assert!(path.ends_with("usb-mirror/adbkey"));
        }
    }
}
