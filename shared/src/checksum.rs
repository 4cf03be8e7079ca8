//! Integrity checksums over canonical JSON encodings
//!
//! Checksums detect drift between replicas and tampering in transit. They
//! are not signatures.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Hash function used for delta and world-state checksums
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Md5,
    Blake3,
}

impl ChecksumAlgorithm {
    /// Hashes raw bytes and returns the lowercase hex digest
    pub fn digest(&self, bytes: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Sha256 => format!("{:x}", Sha256::digest(bytes)),
            ChecksumAlgorithm::Md5 => format!("{:x}", Md5::digest(bytes)),
            ChecksumAlgorithm::Blake3 => blake3::hash(bytes).to_hex().to_string(),
        }
    }

    /// Hashes the canonical JSON encoding of `value`
    ///
    /// Callers must only pass types whose maps are ordered (`BTreeMap`),
    /// otherwise two equal values may hash differently.
    pub fn digest_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.digest(&bytes))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Blake3 => "blake3",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown checksum algorithm '{0}' (expected sha256, md5 or blake3)")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for ChecksumAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "blake3" => Ok(ChecksumAlgorithm::Blake3),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}
