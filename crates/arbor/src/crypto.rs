//! Key derivation and authenticated encryption for the archive tier
//!
//! Every archive record gets its own random salt. The record key is derived
//! from the process-wide master secret with PBKDF2-HMAC-SHA256 and used once
//! with AES-256-GCM.
//!
//! Record layout: `salt (16) || nonce (12) || ciphertext+tag`.

use std::fmt;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ArborError, Result};

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

/// Lowest PBKDF2 iteration count accepted from configuration
pub const MIN_KDF_ITERATIONS: u32 = 480_000;

/// Failures inside the crypto boundary. The archive maps these onto
/// [`ArborError`] once it knows which record was involved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Tag verification failed: wrong key or modified bytes
    #[error("authentication failed")]
    Authentication,

    /// Record is shorter than salt + nonce + tag
    #[error("record truncated: {0} bytes")]
    Truncated(usize),

    /// Cipher could not be set up
    #[error("cipher error: {0}")]
    Cipher(String),
}

impl From<CryptoError> for ArborError {
    fn from(e: CryptoError) -> Self {
        ArborError::Crypto(e.to_string())
    }
}

/// The master secret supplied at process start. Zeroed on drop, never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret(Vec<u8>);

impl MasterSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(ArborError::Crypto("master secret must not be empty".to_string()));
        }
        Ok(Self(secret))
    }

    /// Read the master secret from an environment variable
    pub fn from_env(var: &str) -> Result<Self> {
        let value = std::env::var(var).map_err(|_| {
            ArborError::Config(format!("master secret variable {var} is not set"))
        })?;
        Self::new(value.into_bytes())
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret(<redacted>)")
    }
}

/// A derived 256-bit record key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Key derivation cost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: MIN_KDF_ITERATIONS,
        }
    }
}

impl KdfParams {
    pub fn new(iterations: u32) -> Result<Self> {
        if iterations < MIN_KDF_ITERATIONS {
            return Err(ArborError::Config(format!(
                "kdf iterations must be at least {MIN_KDF_ITERATIONS}, got {iterations}"
            )));
        }
        Ok(Self { iterations })
    }

    /// Bypass the iteration floor. Only for tests, where the full cost would
    /// dominate run time.
    pub fn insecure_for_tests(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

/// Fresh random salt for one record
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill(&mut salt[..]);
    salt
}

/// Derive a record key. Deliberately slow.
pub fn derive_key(secret: &MasterSecret, salt: &[u8], params: &KdfParams) -> SymmetricKey {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, params.iterations, &mut key);
    let derived = SymmetricKey(key);
    key.zeroize();
    derived
}

/// Derive a record key on the blocking pool, giving up after `deadline`
pub async fn derive_key_with_timeout(
    secret: &MasterSecret,
    salt: [u8; SALT_LEN],
    params: KdfParams,
    deadline: Duration,
) -> Result<SymmetricKey> {
    let secret = secret.clone();
    with_deadline("key derivation", deadline, move || {
        derive_key(&secret, &salt, &params)
    })
    .await
}

/// Run blocking crypto work under a deadline.
///
/// A missed deadline is reported as [`ArborError::Timeout`], never as an
/// integrity failure.
pub async fn with_deadline<T, F>(operation: &str, deadline: Duration, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::time::timeout(deadline, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_error)) => Err(ArborError::Crypto(format!(
            "{operation} task failed: {join_error}"
        ))),
        Err(_) => Err(ArborError::Timeout {
            operation: operation.to_string(),
        }),
    }
}

/// Encrypt with AES-256-GCM. Returns `nonce || ciphertext+tag`.
pub fn encrypt(plaintext: &[u8], key: &SymmetricKey) -> std::result::Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill(&mut nonce_bytes[..]);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;

    let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);
    Ok(packed)
}

/// Decrypt `nonce || ciphertext+tag`. Any modification fails authentication.
pub fn decrypt(packed: &[u8], key: &SymmetricKey) -> std::result::Result<Vec<u8>, CryptoError> {
    if packed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Truncated(packed.len()));
    }

    let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

/// Encrypt a full archive record under a fresh salt
pub fn seal_record(
    secret: &MasterSecret,
    plaintext: &[u8],
    params: &KdfParams,
) -> std::result::Result<Vec<u8>, CryptoError> {
    let salt = generate_salt();
    let key = derive_key(secret, &salt, params);
    let sealed = encrypt(plaintext, &key)?;

    let mut record = Vec::with_capacity(SALT_LEN + sealed.len());
    record.extend_from_slice(&salt);
    record.extend_from_slice(&sealed);
    Ok(record)
}

/// Decrypt a full archive record produced by [`seal_record`]
pub fn open_record(
    secret: &MasterSecret,
    record: &[u8],
    params: &KdfParams,
) -> std::result::Result<Vec<u8>, CryptoError> {
    if record.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Truncated(record.len()));
    }
    let (salt, sealed) = record.split_at(SALT_LEN);
    let key = derive_key(secret, salt, params);
    decrypt(sealed, &key)
}
