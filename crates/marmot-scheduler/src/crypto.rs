use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::SchedulerError;

const NONCE_LEN: usize = 12;

/// Encrypts `plaintext` with a fresh random nonce, returning `nonce ||
/// ciphertext` — the shape `decrypt_config` expects and the shape stored in
/// `PipelineSchedule::config`.
pub fn encrypt_config(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, plaintext).expect("AES-GCM encryption with a valid key never fails");

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypts a blob produced by `encrypt_config`. Per spec.md 4.H: refuses
/// to start if encryption is required (a key is configured) and the blob
/// doesn't decrypt, or if no key is configured at all.
pub fn decrypt_config(key: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, SchedulerError> {
    if blob.len() < NONCE_LEN {
        return Err(SchedulerError::Decrypt("config blob shorter than nonce".to_string()));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher.decrypt(nonce, ciphertext).map_err(|_| SchedulerError::Decrypt("authentication failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encrypt_and_decrypt() {
        let key = [7u8; 32];
        let blob = encrypt_config(&key, b"{\"bucket\":\"my-bucket\"}");
        let plaintext = decrypt_config(&key, &blob).unwrap();
        assert_eq!(plaintext, b"{\"bucket\":\"my-bucket\"}");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let blob = encrypt_config(&[1u8; 32], b"secret");
        assert!(decrypt_config(&[2u8; 32], &blob).is_err());
    }
}
