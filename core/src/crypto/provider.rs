// AEAD provider: AES-128-GCM with the tag appended to the ciphertext

use super::{CryptoError, KEY_LENGTH, NONCE_LENGTH, TAG_LENGTH};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Nonce,
};

/// External encryption capability.
///
/// `encrypt` returns `ciphertext || tag`; `decrypt` takes the same layout.
pub trait EncryptionProvider: Send + Sync {
    fn encrypt(
        &self,
        key: &[u8; KEY_LENGTH],
        nonce: &[u8; NONCE_LENGTH],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(
        &self,
        key: &[u8; KEY_LENGTH],
        nonce: &[u8; NONCE_LENGTH],
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// Software AES-128-GCM
#[derive(Debug, Clone, Copy, Default)]
pub struct AesGcmProvider;

impl EncryptionProvider for AesGcmProvider {
    fn encrypt(
        &self,
        key: &[u8; KEY_LENGTH],
        nonce: &[u8; NONCE_LENGTH],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        cipher
            .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    fn decrypt(
        &self,
        key: &[u8; KEY_LENGTH],
        nonce: &[u8; NONCE_LENGTH],
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < TAG_LENGTH {
            return Err(CryptoError::CiphertextTooShort(sealed.len()));
        }

        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad })
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}
