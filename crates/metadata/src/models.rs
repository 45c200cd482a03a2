//! Database models mapping to the reference store schema.

use crate::error::MetadataResult;
use chunkref_core::{ChunkHash, Reference};
use sqlx::FromRow;
use time::PrimitiveDateTime;

/// Chunk record.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ChunkRow {
    pub chunk: String,
    /// Set once, when the last reference was removed. UTC.
    pub deleting: Option<PrimitiveDateTime>,
}

impl ChunkRow {
    pub fn hash(&self) -> MetadataResult<ChunkHash> {
        Ok(ChunkHash::new(self.chunk.as_str())?)
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.is_some()
    }
}

/// Reference record. `sourcetype` is read back as text on every backend.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RefRow {
    pub sourcetype: String,
    pub source: String,
    pub chunk: String,
}

impl TryFrom<RefRow> for Reference {
    type Error = crate::error::MetadataError;

    fn try_from(row: RefRow) -> MetadataResult<Self> {
        Ok(Reference::new(
            row.sourcetype.parse()?,
            row.source,
            ChunkHash::new(row.chunk)?,
        ))
    }
}
