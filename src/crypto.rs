use std::fmt;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;

use crate::error::AppError;

const NONCE_LEN: usize = 12;

/// Encrypts small secret strings for storage.
///
/// Stored form is `base64url(nonce || ciphertext)`.
#[derive(Clone)]
pub struct TokenCrypt {
    cipher: ChaCha20Poly1305,
}

impl fmt::Debug for TokenCrypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenCrypt(..)")
    }
}

impl TokenCrypt {
    /// Builds the cipher from a 64 character hex key.
    pub fn from_hex_key(hex_key: &str) -> Result<Self, AppError> {
        let key = hex::decode(hex_key.trim())
            .map_err(|e| AppError::internal(format!("decode encryption key: {e}")))?;
        if key.len() != 32 {
            return Err(AppError::internal(format!(
                "invalid encryption key length: expected 32 bytes, got {}",
                key.len()
            )));
        }

        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    pub fn encrypt_string(&self, plaintext: &str) -> Result<String, AppError> {
        if plaintext.is_empty() {
            return Err(AppError::internal("plaintext is empty"));
        }

        let mut nonce = [0_u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| AppError::internal(format!("encrypt secret: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    pub fn decrypt_string(&self, encoded: &str) -> Result<String, AppError> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| AppError::corrupt("encrypted secret", e))?;
        if raw.len() <= NONCE_LEN {
            return Err(AppError::corrupt("encrypted secret", "ciphertext too short"));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| AppError::internal(format!("decrypt secret: {e}")))?;

        String::from_utf8(plaintext).map_err(|e| AppError::corrupt("decrypted secret", e))
    }
}
