//! Field-level encryption for conversation payload columns.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Marks values written by [`FieldCipher`]. Anything without it is legacy plaintext.
pub const ENCRYPTED_PREFIX: &str = "enc:v1:";

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encryption key must not be empty")]
    EmptyKey,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("encrypted value is malformed: {0}")]
    Malformed(String),
}

/// AES-256-GCM with a key derived from the configured secret via SHA-256.
/// Output layout: `enc:v1:` + base64(nonce || ciphertext).
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    pub fn from_secret(secret: &str) -> Result<Self, CipherError> {
        if secret.trim().is_empty() {
            return Err(CipherError::EmptyKey);
        }
        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| CipherError::EmptyKey)?;
        Ok(Self { cipher })
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext =
            self.cipher.encrypt(&nonce, plaintext.as_bytes()).map_err(|_| CipherError::Encrypt)?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(nonce.as_slice());
        packed.extend_from_slice(&ciphertext);
        Ok(format!("{ENCRYPTED_PREFIX}{}", STANDARD.encode(packed)))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CipherError> {
        let Some(encoded) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(stored.to_string());
        };

        let packed =
            STANDARD.decode(encoded).map_err(|err| CipherError::Malformed(err.to_string()))?;
        if packed.len() <= NONCE_LEN {
            return Err(CipherError::Malformed("payload shorter than nonce".to_string()));
        }

        let (nonce, ciphertext) = packed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|err| CipherError::Malformed(err.to_string()))
    }

    /// Encrypts and decrypts a sample value. Used by `doctor`.
    pub fn self_test(&self) -> Result<(), CipherError> {
        let sample = "warden-cipher-self-test";
        let sealed = self.encrypt(sample)?;
        if self.decrypt(&sealed)? == sample {
            Ok(())
        } else {
            Err(CipherError::Decrypt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CipherError, FieldCipher, ENCRYPTED_PREFIX};

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn encrypted_values_carry_sentinel_and_hide_plaintext() {
        let cipher = FieldCipher::from_secret(KEY).expect("cipher");
        let sealed = cipher.encrypt(r#"[{"content":"hello"}]"#).expect("encrypt");

        assert!(sealed.starts_with(ENCRYPTED_PREFIX));
        assert!(!sealed.contains("hello"));
        assert_eq!(cipher.decrypt(&sealed).expect("decrypt"), r#"[{"content":"hello"}]"#);
    }

    #[test]
    fn nonces_differ_between_writes() {
        let cipher = FieldCipher::from_secret(KEY).expect("cipher");
        let first = cipher.encrypt("same").expect("encrypt");
        let second = cipher.encrypt("same").expect("encrypt");
        assert_ne!(first, second);
    }

    #[test]
    fn legacy_plaintext_passes_through() {
        let cipher = FieldCipher::from_secret(KEY).expect("cipher");
        assert_eq!(cipher.decrypt("[]").expect("legacy"), "[]");
    }

    #[test]
    fn wrong_key_and_tampering_fail_to_decrypt() {
        let cipher = FieldCipher::from_secret(KEY).expect("cipher");
        let other = FieldCipher::from_secret("another-key-another-key-another-key").expect("cipher");
        let sealed = cipher.encrypt("secret transcript").expect("encrypt");

        assert!(matches!(other.decrypt(&sealed), Err(CipherError::Decrypt)));
        assert!(matches!(
            cipher.decrypt(&format!("{ENCRYPTED_PREFIX}not base64!")),
            Err(CipherError::Malformed(_))
        ));
        assert!(cipher.self_test().is_ok());
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(FieldCipher::from_secret("  "), Err(CipherError::EmptyKey)));
    }
}
