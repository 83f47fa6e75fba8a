//! Datagrams: which fields of a kind are sensitive, and how they are sealed.
//!
//! Sealed form: base64 of `version || nonce || ciphertext`, where the
//! plaintext is the DEFLATE-compressed JSON object of the covered fields and
//! the datagram type is bound as associated data.

use super::cipher::{self, SymmetricKey};
use super::{CryptoError, Result};
use crate::entity::Patch;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
    pub kind: &'static str,
    pub version: u8,
    pub fields: &'static [&'static str],
}

pub const DOCUMENT: Datagram = Datagram {
    kind: "datagram:document",
    version: 1,
    fields: &["title", "content", "mdContent"],
};

pub const FOLDER: Datagram = Datagram {
    kind: "datagram:folder",
    version: 1,
    fields: &["name"],
};

pub const TASK: Datagram = Datagram {
    kind: "datagram:task",
    version: 1,
    fields: &["text", "description"],
};

pub const EVENT: Datagram = Datagram {
    kind: "datagram:event",
    version: 1,
    fields: &["text", "description"],
};

pub const INTEGRATION: Datagram = Datagram {
    kind: "datagram:integration",
    version: 1,
    fields: &["data"],
};

pub const IMAGE_OBJECT: Datagram = Datagram {
    kind: "datagram:image-object",
    version: 1,
    fields: &["name"],
};

pub const IMAGE_DATA: Datagram = Datagram {
    kind: "datagram:image",
    version: 1,
    fields: &["data"],
};

pub const VERSION: Datagram = Datagram {
    kind: "datagram:version",
    version: 1,
    fields: &["content"],
};

/// Kinds stored in plaintext.
pub const NONE: Datagram = Datagram {
    kind: "none",
    version: 0,
    fields: &[],
};

impl Datagram {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether the patch touches any covered field.
    pub fn covers(&self, patch: &Patch) -> bool {
        self.fields.iter().any(|field| patch.contains(field))
    }

    /// Copy of the covered fields present in `object`.
    pub fn extract(&self, object: &Map<String, Value>) -> Map<String, Value> {
        self.fields
            .iter()
            .filter_map(|field| object.get(*field).map(|v| (field.to_string(), v.clone())))
            .collect()
    }

    /// Remove the covered fields; the entity falls back to field defaults.
    pub fn clear(&self, object: &mut Map<String, Value>) {
        for field in self.fields {
            object.remove(*field);
        }
    }

    pub fn seal(&self, key: &SymmetricKey, object: &Map<String, Value>) -> Result<String> {
        let json = serde_json::to_vec(&self.extract(object))
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        let compressed = cipher::compress(&json)?;
        let sealed = key.encrypt(&compressed, self.kind.as_bytes())?;

        let mut out = Vec::with_capacity(1 + sealed.len());
        out.push(self.version);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    /// Recover the covered fields from a sealed string.
    pub fn open(&self, key: &SymmetricKey, encoded: &str) -> Result<Map<String, Value>> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        let Some((&version, sealed)) = bytes.split_first() else {
            return Err(CryptoError::Malformed("empty datagram".into()));
        };
        if version != self.version {
            return Err(CryptoError::UnsupportedVersion {
                kind: self.kind,
                version,
            });
        }

        let compressed = key.decrypt(sealed, self.kind.as_bytes())?;
        let json = cipher::decompress(&compressed)?;
        match serde_json::from_slice(&json) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(_) => Err(CryptoError::Malformed("datagram is not an object".into())),
            Err(e) => Err(CryptoError::Malformed(e.to_string())),
        }
    }
}
