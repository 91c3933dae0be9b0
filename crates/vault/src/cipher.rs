//! AES-256-GCM implementation of the [`Cipher`] trait.

use {
    aes_gcm::{
        Aes256Gcm, Nonce,
        aead::{Aead, KeyInit, Payload},
    },
    rand::RngCore,
    sha2::{Digest, Sha256},
    zeroize::Zeroizing,
};

use crate::error::VaultError;

/// Nonce size for AES-GCM (12 bytes, random per record).
const NONCE_LEN: usize = 12;

/// Trait for authenticated encryption with associated data (AEAD).
///
/// Implementations can be swapped without changing the rest of the vault.
pub trait Cipher: Send + Sync {
    /// Encrypt `plaintext` with `key` and `aad` (additional authenticated data).
    ///
    /// Returns `[nonce || ciphertext || tag]` — the exact layout is
    /// cipher-specific but must be parseable by [`decrypt`](Self::decrypt).
    fn encrypt(&self, key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, VaultError>;

    /// Decrypt a blob previously produced by [`encrypt`](Self::encrypt).
    fn decrypt(&self, key: &[u8; 32], ciphertext: &[u8], aad: &[u8])
    -> Result<Vec<u8>, VaultError>;
}

/// Derive the process-wide vault key from the operator-provided secret.
/// Loaded once at startup.
#[must_use]
pub fn derive_process_key(secret: &str) -> Zeroizing<[u8; 32]> {
    let digest = Sha256::digest(secret.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&digest);
    key
}

/// AES-256-GCM AEAD cipher.
///
/// Encrypted blob layout: `[nonce: 12 bytes][ciphertext + GCM tag: N + 16 bytes]`.
pub struct Aes256GcmCipher;

impl Cipher for Aes256GcmCipher {
    fn encrypt(&self, key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, VaultError> {
        let cipher = Aes256Gcm::new(key.into());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload {
                msg: plaintext,
                aad,
            })
            .map_err(|e| VaultError::CipherError(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(
        &self,
        key: &[u8; 32],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, VaultError> {
        if ciphertext.len() < NONCE_LEN + 16 {
            return Err(VaultError::CipherError("ciphertext too short".to_string()));
        }

        let (nonce_bytes, ct) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = Aes256Gcm::new(key.into());

        cipher
            .decrypt(nonce, Payload { msg: ct, aad })
            .map_err(|e| VaultError::CipherError(e.to_string()))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_no_aad() {
        let cipher = Aes256GcmCipher;
        let key = [0x42u8; 32];
        let plaintext = b"sk-ant-apikey";

        let encrypted = cipher.encrypt(&key, plaintext, b"").unwrap();
        let decrypted = cipher.decrypt(&key, &encrypted, b"").unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn round_trip_with_aad() {
        let cipher = Aes256GcmCipher;
        let key = [0x42u8; 32];
        let plaintext = b"refresh-token";
        let aad = b"credential:abc";

        let encrypted = cipher.encrypt(&key, plaintext, aad).unwrap();
        let decrypted = cipher.decrypt(&key, &encrypted, aad).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let cipher = Aes256GcmCipher;
        let key1 = [0x42u8; 32];
        let key2 = [0x43u8; 32];

        let encrypted = cipher.encrypt(&key1, b"secret", b"").unwrap();
        assert!(cipher.decrypt(&key2, &encrypted, b"").is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = Aes256GcmCipher;
        let key = [0x42u8; 32];

        let mut encrypted = cipher.encrypt(&key, b"secret", b"").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(cipher.decrypt(&key, &encrypted, b"").is_err());
    }

    #[test]
    fn too_short_ciphertext_fails() {
        let cipher = Aes256GcmCipher;
        assert!(cipher.decrypt(&[0x42u8; 32], &[0u8; 20], b"").is_err());
    }

    #[test]
    fn different_nonces_produce_different_ciphertexts() {
        let cipher = Aes256GcmCipher;
        let key = [0x42u8; 32];

        let enc1 = cipher.encrypt(&key, b"same input", b"").unwrap();
        let enc2 = cipher.encrypt(&key, b"same input", b"").unwrap();
        assert_ne!(enc1, enc2);
    }

    #[test]
    fn derived_key_is_deterministic() {
        assert_eq!(
            *derive_process_key("operator-secret"),
            *derive_process_key("operator-secret")
        );
        assert_ne!(
            *derive_process_key("operator-secret"),
            *derive_process_key("other-secret")
        );
    }
}
