//! Content-addressed cache keys
//!
//! A key is the SHA256 digest of the raw source bytes, truncated to 160 bits
//! and hex encoded. Same source = same key, and a valid key can be joined onto
//! a storage path without escaping it.

use crate::error::{DuckError, DuckResult};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of digest bytes kept in a key
const KEY_BYTES: usize = 20;

/// Length of the textual key
pub const KEY_LEN: usize = KEY_BYTES * 2;

/// Lowercase hex digest identifying one piece of source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Parse a candidate identifier, rejecting anything that is not a key
    pub fn parse(candidate: &str) -> DuckResult<Self> {
        if is_valid_key(candidate) {
            Ok(Self(candidate.to_string()))
        } else {
            Err(DuckError::InvalidKey(candidate.to_string()))
        }
    }

    /// The key as a hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Compute the cache key for a piece of source
pub fn compute_key(source: &[u8]) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(source);
    let digest = hasher.finalize();

    CacheKey(hex::encode(&digest[..KEY_BYTES]))
}

/// Check that a candidate is exactly `KEY_LEN` lowercase hex characters
pub fn is_valid_key(candidate: &str) -> bool {
    candidate.len() == KEY_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
