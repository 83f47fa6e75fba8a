//! Encryption at rest for remote vaults.

pub mod cipher;
pub mod datagram;
pub mod entity;
pub mod keys;
pub mod reencrypt;
pub mod sharing;

pub use cipher::SymmetricKey;
pub use datagram::Datagram;
pub use entity::{EncryptionPolicy, EntityEncryption, IntegrationEncryption};
pub use keys::KeyRing;
pub use reencrypt::{
    AttachmentReencryptor, ReencryptConfig, ReencryptionDirection, ReencryptionMarker,
};
pub use sharing::{SharedEntityEncryption, SharingHook};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("No key loaded for vault {0}")]
    MissingVaultKey(String),

    #[error("Entity {0} is encrypted but has no encryption key")]
    MissingEntityKey(String),

    #[error("Invalid key material")]
    InvalidKey,

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed: wrong key or tampered data")]
    Decrypt,

    #[error("Malformed encrypted data: {0}")]
    Malformed(String),

    #[error("Unsupported {kind} version {version}")]
    UnsupportedVersion { kind: &'static str, version: u8 },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
