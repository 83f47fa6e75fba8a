//! AES-256-GCM sealing and DEFLATE compression.

use super::{CryptoError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rand::RngCore;
use std::fmt;
use std::io::{Read, Write};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::InvalidKey)
    }

    /// Encrypt under a random nonce. Output is `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Reverse of [`encrypt`](Self::encrypt). Fails on a wrong key, wrong
    /// `aad` or tampered input.
    pub fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Malformed("sealed data shorter than nonce".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CryptoError::Malformed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CryptoError::Malformed(e.to_string()))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| CryptoError::Malformed(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = SymmetricKey::generate();
        let sealed = key.encrypt(b"secret", b"ctx").unwrap();

        assert_ne!(&sealed[NONCE_LEN..], b"secret");
        assert_eq!(key.decrypt(&sealed, b"ctx").unwrap(), b"secret");
    }

    #[test]
    fn test_wrong_key_or_context_fails() {
        let key = SymmetricKey::generate();
        let sealed = key.encrypt(b"secret", b"ctx").unwrap();

        assert!(matches!(
            SymmetricKey::generate().decrypt(&sealed, b"ctx"),
            Err(CryptoError::Decrypt)
        ));
        assert!(matches!(key.decrypt(&sealed, b"other"), Err(CryptoError::Decrypt)));
        assert!(matches!(key.decrypt(&sealed[..4], b"ctx"), Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let key = SymmetricKey::generate();
        let a = key.encrypt(b"same", b"").unwrap();
        let b = key.encrypt(b"same", b"").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_compression() {
        let text = "repeat ".repeat(100);
        let packed = compress(text.as_bytes()).unwrap();

        assert!(packed.len() < text.len());
        assert_eq!(decompress(&packed).unwrap(), text.as_bytes());
    }

    #[test]
    fn test_key_length_is_checked() {
        assert!(matches!(SymmetricKey::from_bytes(&[0u8; 16]), Err(CryptoError::InvalidKey)));
        assert!(SymmetricKey::from_bytes(&[7u8; KEY_LEN]).is_ok());
    }
}
