//! Chunk identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Maximum accepted length of a chunk hash, in bytes.
pub const MAX_HASH_LEN: usize = 512;

/// Content hash identifying a chunk.
///
/// The hash is opaque to the reference-counting protocol: any non-empty string
/// without whitespace, control characters, path separators or `:` is accepted
/// (`:` delimits the text form of a [`Reference`](crate::Reference)), so
/// callers may use whatever digest their chunker produces. [`ChunkHash::compute`]
/// produces the lowercase hex SHA-256 used by the bundled content store.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChunkHash(String);

impl ChunkHash {
    /// Validate and wrap a hash string.
    pub fn new(hash: impl Into<String>) -> crate::Result<Self> {
        let hash = hash.into();
        validate(&hash)?;
        Ok(Self(hash))
    }

    /// Compute the SHA-256 hash of chunk data.
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Borrow the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the hash string.
    pub fn into_string(self) -> String {
        self.0
    }

    /// Get the object store key for this chunk's content.
    ///
    /// Hashes of at least four bytes are fanned out over two directory
    /// levels of two bytes each to keep directories small. Shorter hashes live
    /// under `chunks/short/`, which can never clash with a two-byte fan-out
    /// directory, so no key is ever a prefix directory of another.
    pub fn to_object_key(&self) -> String {
        let hash = &self.0;
        if hash.len() >= 4 && hash.is_char_boundary(2) && hash.is_char_boundary(4) {
            format!("chunks/{}/{}/{}", &hash[..2], &hash[2..4], hash)
        } else {
            format!("chunks/short/{hash}")
        }
    }
}

fn validate(hash: &str) -> crate::Result<()> {
    if hash.is_empty() {
        return Err(crate::Error::InvalidHash("empty hash".to_string()));
    }
    if hash.len() > MAX_HASH_LEN {
        return Err(crate::Error::InvalidHash(format!(
            "hash is {} bytes (max {MAX_HASH_LEN})",
            hash.len()
        )));
    }
    if let Some(c) = hash
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '\\' | ':'))
    {
        return Err(crate::Error::InvalidHash(format!(
            "hash {hash:?} contains forbidden character {c:?}"
        )));
    }
    if hash == "." || hash == ".." {
        return Err(crate::Error::InvalidHash(format!("reserved name {hash:?}")));
    }
    Ok(())
}

impl FromStr for ChunkHash {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ChunkHash {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<ChunkHash> for String {
    fn from(hash: ChunkHash) -> Self {
        hash.0
    }
}

impl AsRef<str> for ChunkHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = match self.0.char_indices().nth(16) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        };
        write!(f, "ChunkHash({shown})")
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
