use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length in bytes of a [`ContentDigest`].
pub const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("Digest mismatch: expected {expected}, actual {actual}")]
    DigestMismatch {
        expected: ContentDigest,
        actual: ContentDigest,
    },

    #[error("Invalid digest format: {0}")]
    InvalidFormat(String),
}

/// SHA-256 digest identifying an artifact by its content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest([u8; DIGEST_LEN]);

impl ContentDigest {
    /// Compute the digest of `bytes`.
    pub fn compute(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify that `bytes` hash to this digest.
    pub fn verify(&self, bytes: &[u8]) -> Result<(), IntegrityError> {
        let actual = Self::compute(bytes);
        if actual == *self {
            Ok(())
        } else {
            Err(IntegrityError::DigestMismatch {
                expected: *self,
                actual,
            })
        }
    }
}

impl FromStr for ContentDigest {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_LEN * 2 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IntegrityError::InvalidFormat(s.to_string()));
        }
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| IntegrityError::InvalidFormat(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
