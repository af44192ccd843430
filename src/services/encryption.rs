use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;

const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing for scan images at rest.
pub struct ImageCipher {
    cipher: Aes256Gcm,
}

impl ImageCipher {
    /// Create from a base64-encoded 32-byte key.
    pub fn from_base64(key_base64: &str) -> Result<Self, EncryptionError> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_base64.trim())
            .map_err(|_| EncryptionError::InvalidKey)?;

        if key_bytes.len() != 32 {
            return Err(EncryptionError::InvalidKey);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| EncryptionError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Returns `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if sealed.len() < NONCE_LEN {
            return Err(EncryptionError::DecryptFailed);
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| EncryptionError::DecryptFailed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Invalid encryption key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("Image encryption failed")]
    EncryptFailed,

    #[error("Image decryption failed (wrong key or corrupted object)")]
    DecryptFailed,
}
