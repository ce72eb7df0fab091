//! Encryption of the database passwords stored in the catalog.
//!
//! Stored passwords are version tagged. The only scheme understood is `v1`:
//! AES-256-GCM with a random 96-bit nonce, encoded as
//! `v1:` + base64(`nonce || ciphertext || tag`).
//!
//! Values written by older tooling (unprefixed base64, AES-CBC) are rejected
//! with [CredentialError::UnsupportedScheme] and have to be re-encrypted using
//! `db_backup encrypt-password`.

use std::env;
use std::string::FromUtf8Error;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use derive_more::{Display, Error};
use zeroize::Zeroizing;

/// Prefix of every stored password encrypted with the current scheme.
pub const SCHEME_PREFIX: &str = "v1:";

/// Environment variable holding the base64 encoded key if not configured otherwise.
pub const DEFAULT_KEY_ENV: &str = "DATABASE_BACKUP_KEY";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Key used to encrypt and decrypt stored passwords.
///
/// The key bytes are wiped from memory on drop.
pub struct KeyMaterial {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// The key material could not be obtained.
#[derive(Debug, Display, Error)]
pub enum KeyError {
    /// The environment variable is not set.
    #[display("environment variable {_0} is not set")]
    Missing(#[error(ignore)] String),
    /// The environment variable doesn't contain base64.
    #[display("environment variable {var} is not valid base64: {source}")]
    Encoding {
        var: String,
        source: base64::DecodeError,
    },
    /// The decoded key has the wrong size.
    #[display("key must be 32 bytes long, got {_0}")]
    Length(#[error(ignore)] usize),
}

/// A stored password couldn't be decrypted.
#[derive(Debug, Display, Error)]
pub enum CredentialError {
    /// The stored value doesn't carry the `v1:` scheme prefix.
    #[display("stored password uses an unsupported scheme, re-encrypt it with `encrypt-password`")]
    UnsupportedScheme,
    /// The payload isn't valid base64.
    #[display("stored password is not valid base64: {_0}")]
    Encoding(base64::DecodeError),
    /// The payload is shorter than a nonce plus authentication tag.
    #[display("stored password is truncated ({_0} bytes)")]
    Truncated(#[error(ignore)] usize),
    /// Authentication failed: wrong key or tampered ciphertext.
    #[display("stored password failed verification")]
    Verification,
    /// The plaintext isn't UTF-8.
    #[display("decrypted password is not valid UTF-8")]
    NotUtf8(FromUtf8Error),
}

impl KeyMaterial {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Decodes a base64 encoded 32 byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let decoded = Zeroizing::new(STANDARD.decode(encoded.trim()).map_err(|source| {
            KeyError::Encoding {
                var: "<inline>".into(),
                source,
            }
        })?);
        let bytes: [u8; KEY_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Length(decoded.len()))?;

        Ok(Self::from_bytes(bytes))
    }

    /// Reads the key from the environment variable `var`.
    pub fn from_env(var: &str) -> Result<Self, KeyError> {
        let encoded =
            Zeroizing::new(env::var(var).map_err(|_| KeyError::Missing(var.to_string()))?);

        Self::from_base64(&encoded).map_err(|e| match e {
            KeyError::Encoding { source, .. } => KeyError::Encoding {
                var: var.to_string(),
                source,
            },
            other => other,
        })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_slice()))
    }
}

/// Decrypts a stored password.
pub fn decrypt(encoded: &str, key: &KeyMaterial) -> Result<Zeroizing<String>, CredentialError> {
    let payload = encoded
        .strip_prefix(SCHEME_PREFIX)
        .ok_or(CredentialError::UnsupportedScheme)?;
    let data = STANDARD
        .decode(payload.trim())
        .map_err(CredentialError::Encoding)?;

    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CredentialError::Truncated(data.len()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);

    let plaintext = key
        .cipher()
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CredentialError::Verification)?;

    String::from_utf8(plaintext)
        .map(Zeroizing::new)
        .map_err(CredentialError::NotUtf8)
}

/// Encrypts `plaintext` into the stored form understood by [decrypt].
pub fn encrypt(plaintext: &str, key: &KeyMaterial) -> Result<String, CredentialError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = key
        .cipher()
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| CredentialError::Verification)?;

    let mut data = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    data.extend_from_slice(nonce.as_slice());
    data.extend_from_slice(&ciphertext);

    Ok(format!("{SCHEME_PREFIX}{}", STANDARD.encode(data)))
}
