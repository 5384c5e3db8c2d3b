// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Credential Encryption (C16, spec §4.16): at-rest encryption for refresh
//! tokens and other account secrets written to the persistence layer.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::Engine;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("ciphertext is malformed or truncated")]
    MalformedCiphertext,
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,
}

/// Encrypts/decrypts credential blobs at rest. Ciphertext is
/// base64(nonce || aes-gcm(plaintext)); the nonce is generated fresh per
/// call and stored alongside the ciphertext rather than derived, so the
/// same plaintext never produces the same ciphertext twice.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// `key` must be exactly 32 bytes (AES-256). Pass the raw key material,
    /// not a passphrase — callers are expected to derive or generate it
    /// themselves and persist it outside the database (e.g. an env var).
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != 32 {
            return Err(CipherError::InvalidKey(format!("expected 32 bytes, got {}", key.len())));
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self { cipher: Aes256Gcm::new(key) })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::DecryptionFailed)?;
        let mut combined = Vec::with_capacity(nonce.len() + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CipherError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| CipherError::MalformedCiphertext)?;
        if combined.len() < 12 {
            return Err(CipherError::MalformedCiphertext);
        }
        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext =
            self.cipher.decrypt(nonce, ciphertext).map_err(|_| CipherError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn round_trips_plaintext() {
        let cipher = CredentialCipher::new(&test_key()).unwrap();
        let encrypted = cipher.encrypt("refresh-token-value").unwrap();
        assert_ne!(encrypted, "refresh-token-value");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "refresh-token-value");
    }

    #[test]
    fn same_plaintext_encrypts_differently_each_time() {
        let cipher = CredentialCipher::new(&test_key()).unwrap();
        let a = cipher.encrypt("same input").unwrap();
        let b = cipher.encrypt("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_key_of_wrong_length() {
        let err = CredentialCipher::new(&[1u8; 16]).unwrap_err();
        assert!(matches!(err, CipherError::InvalidKey(_)));
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let cipher = CredentialCipher::new(&test_key()).unwrap();
        let mut encrypted = cipher.encrypt("secret").unwrap();
        encrypted.push('A');
        assert!(cipher.decrypt(&encrypted).is_err());
    }

    #[test]
    fn rejects_ciphertext_encrypted_under_a_different_key() {
        let cipher_a = CredentialCipher::new(&test_key()).unwrap();
        let cipher_b = CredentialCipher::new(&[9u8; 32]).unwrap();
        let encrypted = cipher_a.encrypt("secret").unwrap();
        assert!(matches!(cipher_b.decrypt(&encrypted), Err(CipherError::DecryptionFailed)));
    }
}
