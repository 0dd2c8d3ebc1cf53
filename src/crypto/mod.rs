//! AES-256-GCM encryption and Argon2id key derivation for archive payloads.
//!
//! Key derivation: Argon2id(passphrase, salt) → 32-byte key, with the cost
//! parameters fixed by the crypto suite named in the manifest.
//! Encryption:     AES-256-GCM, explicit 12-byte nonce, 16-byte tag appended.
//!
//! Salt and nonce are fresh per export and travel in cleartext inside the
//! manifest.  The passphrase is never stored.
//!
//! Key material never outlives one call: [`with_key`] derives the key into a
//! `Zeroizing` buffer, lends it to a closure and wipes it on every exit path.
//! Decrypted plaintext is returned as `Zeroizing<Vec<u8>>` for the same
//! reason.

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;
use zeroize::Zeroizing;

/// Suite identifier written into the manifest of every encrypted archive.
pub const ALGORITHM_ID: &str = "Argon2id+AES-256-GCM";

pub const KEY_LEN:   usize = 32;
pub const SALT_LEN:  usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN:   usize = 16;

pub type Key = Zeroizing<[u8; KEY_LEN]>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    /// Wrong passphrase or tampered ciphertext.  Never accompanied by data.
    #[error("Authentication failed: wrong passphrase or tampered data")]
    AuthenticationFailed,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Passphrase must not be empty")]
    EmptyPassphrase,
    #[error("Unsupported encryption suite '{0}'")]
    UnsupportedSuite(String),
    #[error("Invalid {field}: expected {expected} bytes, got {actual}")]
    BadParameter { field: &'static str, expected: usize, actual: usize },
}

// ── Suites ───────────────────────────────────────────────────────────────────

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    /// Iterations.
    pub t_cost: u32,
    /// Lanes.
    pub p_cost: u32,
}

/// A versioned pairing of KDF parameters and AEAD cipher.  New suites are
/// appended; existing ids keep their parameters forever so old archives
/// stay decryptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suite {
    pub id:  &'static str,
    pub kdf: KdfParams,
}

pub const SUITES: &[Suite] = &[Suite {
    id:  ALGORITHM_ID,
    kdf: KdfParams { m_cost: 128 * 1024, t_cost: 4, p_cost: 2 },
}];

/// The suite new archives are written with.
pub fn current_suite() -> &'static Suite {
    &SUITES[SUITES.len() - 1]
}

pub fn suite(id: &str) -> Result<&'static Suite, CryptoError> {
    SUITES
        .iter()
        .find(|s| s.id == id)
        .ok_or_else(|| CryptoError::UnsupportedSuite(id.to_owned()))
}

// ── Passphrase ───────────────────────────────────────────────────────────────

/// A user passphrase.  Wiped on drop, redacted in `Debug`.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for Passphrase {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Passphrase {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase([REDACTED])")
    }
}

// ── Primitives ───────────────────────────────────────────────────────────────

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Derive a 256-bit key from a passphrase and salt using Argon2id.
pub fn derive_key(passphrase: &Passphrase, salt: &[u8], params: &KdfParams) -> Result<Key, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::EmptyPassphrase);
    }
    let params = Params::new(params.m_cost, params.t_cost, params.p_cost, Some(KEY_LEN))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.expose(), salt, &mut key[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Encrypt `plaintext` with AES-256-GCM.  Returns `ciphertext || tag`.
pub fn encrypt(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailed)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt `ciphertext || tag`.  Fails closed: any mismatch yields
/// [`CryptoError::AuthenticationFailed`] and no bytes.
pub fn decrypt(
    key:        &[u8; KEY_LEN],
    nonce:      &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AuthenticationFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Derive a key, lend it to `f`, and wipe it before returning.
pub fn with_key<T>(
    passphrase: &Passphrase,
    salt:       &[u8],
    suite:      &Suite,
    f:          impl FnOnce(&[u8; KEY_LEN]) -> Result<T, CryptoError>,
) -> Result<T, CryptoError> {
    let key = derive_key(passphrase, salt, &suite.kdf)?;
    f(&key)
}

// ── Sealing ──────────────────────────────────────────────────────────────────

/// Ciphertext plus the public parameters needed to open it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub suite:      &'static str,
    pub salt:       [u8; SALT_LEN],
    pub nonce:      [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Encrypt with a fresh salt and nonce under the current suite.
pub fn seal(passphrase: &Passphrase, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    let suite = current_suite();
    let salt = generate_salt();
    let nonce = generate_nonce();
    let ciphertext = with_key(passphrase, &salt, suite, |key| encrypt(key, &nonce, plaintext))?;
    Ok(Sealed { suite: suite.id, salt, nonce, ciphertext })
}

/// Decrypt a payload given the manifest's suite id, salt and nonce.
pub fn open(
    passphrase: &Passphrase,
    suite_id:   &str,
    salt:       &[u8],
    nonce:      &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let suite = suite(suite_id)?;
    if salt.len() != SALT_LEN {
        return Err(CryptoError::BadParameter { field: "salt", expected: SALT_LEN, actual: salt.len() });
    }
    let nonce: &[u8; NONCE_LEN] = nonce.try_into().map_err(|_| CryptoError::BadParameter {
        field: "nonce",
        expected: NONCE_LEN,
        actual: nonce.len(),
    })?;
    with_key(passphrase, salt, suite, |key| decrypt(key, nonce, ciphertext))
}
