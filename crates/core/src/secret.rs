//! Secrets at rest.
//!
//! Repository passphrases and the credentials inside database/sync
//! sub-configs are sealed with AES-256-GCM before they reach the job store.
//! The key is derived with Argon2id from the operator's master secret and a
//! random salt persisted next to the database. Sealed values are laid out as
//! `nonce (12 bytes) || ciphertext+tag`.

use std::fmt;
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use rand::RngCore;
use serde::Deserialize;

/// Salt length written to the salt file.
const SALT_LEN: usize = 16;

/// AES-GCM nonce length.
const NONCE_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Wrong key or tampered ciphertext. Carries no detail on purpose.
    #[error("Sealed value could not be opened")]
    Open,

    #[error("Sealed value could not be created")]
    Seal,

    #[error("Salt file error: {0}")]
    SaltFile(#[from] std::io::Error),

    #[error("Opened value is not valid UTF-8")]
    Encoding,
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// A string that must never be printed or serialized.
///
/// `Debug` prints `***`. There is no `Serialize` impl; a field that is
/// only ever written inside a sealed blob opts in with
/// `#[serde(serialize_with = "expose_for_sealing")]`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext. Only call at the point of use.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Serializer for secret fields of payloads that are sealed before storage.
pub fn expose_for_sealing<S: serde::Serializer>(
    secret: &Secret,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&secret.0)
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ---------------------------------------------------------------------------
// SecretBox
// ---------------------------------------------------------------------------

/// Seals and opens values with a single derived key.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    /// Build from raw key material. Used by tests and by [`Self::derive`].
    pub fn from_key(key: [u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Derive the key from a master secret and salt with Argon2id.
    pub fn derive(master: &Secret, salt: &[u8]) -> Result<Self, SecretError> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(master.expose().as_bytes(), salt, &mut key)
            .map_err(|e| SecretError::KeyDerivation(e.to_string()))?;
        Ok(Self::from_key(key))
    }

    /// Load the salt at `salt_path` (creating it on first use) and derive.
    pub fn open_or_init(master: &Secret, salt_path: &Path) -> Result<Self, SecretError> {
        let salt = load_or_create_salt(salt_path)?;
        Self::derive(master, &salt)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecretError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SecretError::Seal)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SecretError> {
        if sealed.len() < NONCE_LEN {
            return Err(SecretError::Open);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::Open)
    }

    pub fn seal_secret(&self, secret: &Secret) -> Result<Vec<u8>, SecretError> {
        self.seal(secret.expose().as_bytes())
    }

    pub fn open_secret(&self, sealed: &[u8]) -> Result<Secret, SecretError> {
        let bytes = self.open(sealed)?;
        String::from_utf8(bytes)
            .map(Secret)
            .map_err(|_| SecretError::Encoding)
    }
}

impl fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBox(***)")
    }
}

fn load_or_create_salt(path: &Path) -> Result<Vec<u8>, SecretError> {
    match std::fs::read(path) {
        Ok(salt) if salt.len() >= SALT_LEN => return Ok(salt),
        Ok(_) => {
            return Err(SecretError::SaltFile(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("salt file {} is truncated", path.display()),
            )))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut salt = vec![0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_private(path, &salt)?;
    tracing::info!(path = %path.display(), "Created new secret salt file");
    Ok(salt)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn seal_then_open() {
        let sbox = SecretBox::from_key([7u8; 32]);
        let sealed = sbox.seal_secret(&Secret::new("hunter2")).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"hunter2");
        assert_eq!(sbox.open_secret(&sealed).unwrap().expose(), "hunter2");
    }

    #[test]
    fn nonces_differ_per_seal() {
        let sbox = SecretBox::from_key([7u8; 32]);
        let a = sbox.seal(b"same").unwrap();
        let b = sbox.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = SecretBox::from_key([1u8; 32]).seal(b"data").unwrap();
        let err = SecretBox::from_key([2u8; 32]).open(&sealed).unwrap_err();
        assert_matches!(err, SecretError::Open);
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let sbox = SecretBox::from_key([3u8; 32]);
        let mut sealed = sbox.seal(b"data").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_matches!(sbox.open(&sealed), Err(SecretError::Open));
        assert_matches!(sbox.open(&[0u8; 4]), Err(SecretError::Open));
    }

    #[test]
    fn derived_key_is_stable_for_same_salt() {
        let dir = tempfile::tempdir().unwrap();
        let salt_path = dir.path().join("secret.salt");
        let master = Secret::new("master-key");

        let first = SecretBox::open_or_init(&master, &salt_path).unwrap();
        let sealed = first.seal(b"payload").unwrap();

        let second = SecretBox::open_or_init(&master, &salt_path).unwrap();
        assert_eq!(second.open(&sealed).unwrap(), b"payload");

        let other = SecretBox::open_or_init(&Secret::new("other"), &salt_path).unwrap();
        assert_matches!(other.open(&sealed), Err(SecretError::Open));
    }

    #[cfg(unix)]
    #[test]
    fn salt_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let salt_path = dir.path().join("nested").join("secret.salt");
        SecretBox::open_or_init(&Secret::new("k"), &salt_path).unwrap();
        let mode = std::fs::metadata(&salt_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("p@ss");
        assert_eq!(format!("{secret:?}"), "***");
    }
}
