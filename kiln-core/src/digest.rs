//! Content addressing primitives.
//!
//! Every identifier in the build cache is a SHA-256 digest rendered as
//! `sha256:<hex>`: op digests, fast and slow cache keys, and layer blobs.

use crate::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// The digest algorithm prefix used throughout the engine.
const ALGORITHM: &str = "sha256";

/// Hex length of a SHA-256 digest.
const ENCODED_LEN: usize = 64;

/// A content digest in `sha256:<hex>` form.
///
/// Digests are totally ordered by their string form, which is what the
/// normalizer relies on for canonical record ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Digest raw bytes.
    pub fn from_bytes(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data.as_ref());
        Digest(format!("{}:{:x}", ALGORITHM, hasher.finalize()))
    }

    /// Parse and validate a digest string.
    pub fn parse(value: &str) -> Result<Self> {
        let Some((algorithm, encoded)) = value.split_once(':') else {
            return Err(KilnError::InvalidDigest { value: value.to_string() });
        };
        if algorithm != ALGORITHM
            || encoded.len() != ENCODED_LEN
            || !encoded.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(KilnError::InvalidDigest { value: value.to_string() });
        }
        Ok(Digest(value.to_string()))
    }

    /// The full `sha256:<hex>` form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex payload without the algorithm prefix.
    pub fn encoded(&self) -> &str {
        &self.0[ALGORITHM.len() + 1..]
    }

    /// A short prefix for log and progress output.
    pub fn short(&self) -> &str {
        &self.encoded()[..12]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_deterministic() {
        let a = Digest::from_bytes(b"hello");
        let b = Digest::from_bytes(b"hello");
        let c = Digest::from_bytes(b"world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("sha256:"));
        assert_eq!(a.encoded().len(), 64);
    }

    #[test]
    fn test_parse_round_trip() {
        let d = Digest::from_bytes(b"content");
        let parsed = Digest::parse(d.as_str()).unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Digest::parse("sha256").is_err());
        assert!(Digest::parse("md5:abcdef").is_err());
        assert!(Digest::parse("sha256:xyz").is_err());
        // Uppercase hex is not canonical.
        let d = Digest::from_bytes(b"x");
        let upper = format!("sha256:{}", d.encoded().to_uppercase());
        assert!(Digest::parse(&upper).is_err());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let mut digests = vec![
            Digest::from_bytes(b"c"),
            Digest::from_bytes(b"a"),
            Digest::from_bytes(b"b"),
        ];
        digests.sort();
        let strings: Vec<_> = digests.iter().map(|d| d.as_str().to_string()).collect();
        let mut sorted = strings.clone();
        sorted.sort();
        assert_eq!(strings, sorted);
    }
}
