//! Atom identity and value types
//!
//! An atom is the smallest addressable unit of stored content: a value of at
//! most [`MAX_ATOM_BYTES`] bytes, identified by the SHA-256 digest of its
//! bytes and scoped to a tenant.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Fixed capacity of an atom value in bytes.
pub const MAX_ATOM_BYTES: usize = 64;

/// Width of a content hash in bytes.
pub const CONTENT_HASH_BYTES: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AtomError {
    #[error("Atom value of {len} bytes exceeds capacity of {max} bytes")]
    OversizeValue { len: usize, max: usize },

    #[error("Atom value is empty")]
    EmptyValue,

    #[error("Content hash mismatch: supplied {supplied}, computed {computed}")]
    HashMismatch { supplied: String, computed: String },

    #[error("Invalid content hash encoding: {0}")]
    InvalidHash(String),
}

/// Handle of an atom record.
///
/// Ids are allocated from a monotonic counter and never reused, so a stale
/// handle to a collected atom can never alias a newer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AtomId(pub u64);

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atom:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub u64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tenant:{}", self.0)
    }
}

/// Embedding model / namespace identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(pub u32);

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns:{}", self.0)
    }
}

/// SHA-256 digest of an atom value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; CONTENT_HASH_BYTES]);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; CONTENT_HASH_BYTES];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(CONTENT_HASH_BYTES * 2);
        for b in self.0 {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    pub fn from_hex(value: &str) -> Result<Self, AtomError> {
        let value = value.trim();
        if value.len() != CONTENT_HASH_BYTES * 2 || !value.is_ascii() {
            return Err(AtomError::InvalidHash(value.to_string()));
        }
        let mut out = [0u8; CONTENT_HASH_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16)
                .map_err(|_| AtomError::InvalidHash(value.to_string()))?;
        }
        Ok(Self(out))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An atom value stored inline, at most [`MAX_ATOM_BYTES`] long.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct AtomValue {
    len: u8,
    bytes: [u8; MAX_ATOM_BYTES],
}

impl AtomValue {
    pub fn new(value: &[u8]) -> Result<Self, AtomError> {
        if value.is_empty() {
            return Err(AtomError::EmptyValue);
        }
        if value.len() > MAX_ATOM_BYTES {
            return Err(AtomError::OversizeValue {
                len: value.len(),
                max: MAX_ATOM_BYTES,
            });
        }
        let mut bytes = [0u8; MAX_ATOM_BYTES];
        bytes[..value.len()].copy_from_slice(value);
        Ok(Self {
            len: value.len() as u8,
            bytes,
        })
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of(self.as_bytes())
    }

    /// Computes the content hash and checks it against a caller-supplied digest.
    pub fn verify_hash(&self, supplied: Option<ContentHash>) -> Result<ContentHash, AtomError> {
        let computed = self.content_hash();
        match supplied {
            Some(hash) if hash != computed => Err(AtomError::HashMismatch {
                supplied: hash.to_hex(),
                computed: computed.to_hex(),
            }),
            _ => Ok(computed),
        }
    }
}

impl fmt::Debug for AtomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "AtomValue({:?})", s),
            Err(_) => write!(f, "AtomValue({:?})", self.as_bytes()),
        }
    }
}

impl TryFrom<Vec<u8>> for AtomValue {
    type Error = AtomError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        AtomValue::new(&value)
    }
}

impl From<AtomValue> for Vec<u8> {
    fn from(value: AtomValue) -> Self {
        value.as_bytes().to_vec()
    }
}

/// Free-form modality tag (`"text"`, `"image"`, `"audio"`, ...), normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Modality(String);

impl Modality {
    pub fn new(tag: &str) -> Self {
        Self(tag.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Modality {
    fn from(value: &str) -> Self {
        Modality::new(value)
    }
}
