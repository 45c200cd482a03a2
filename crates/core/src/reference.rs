//! Reference edges and reference updates.

use crate::chunk::ChunkHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category of a reference holder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A chunk keeping another chunk alive (structural dependency).
    Chunk,
    /// A running unit of work holding the chunk.
    Job,
    /// A named object independent of any job.
    Semantic,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [Self::Chunk, Self::Job, Self::Semantic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Job => "job",
            Self::Semantic => "semantic",
        }
    }
}

impl FromStr for SourceKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "chunk" => Ok(Self::Chunk),
            "job" => Ok(Self::Job),
            "semantic" => Ok(Self::Semantic),
            other => Err(crate::Error::InvalidSourceKind(other.to_string())),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A keeps-alive edge from a source to a chunk.
///
/// Identity is the whole triple; the store holds at most one row per triple.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub kind: SourceKind,
    pub source: String,
    pub chunk: ChunkHash,
}

impl Reference {
    pub fn new(kind: SourceKind, source: impl Into<String>, chunk: ChunkHash) -> Self {
        Self {
            kind,
            source: source.into(),
            chunk,
        }
    }

    /// A reference held by a running job.
    pub fn job(job: impl Into<String>, chunk: ChunkHash) -> Self {
        Self::new(SourceKind::Job, job, chunk)
    }

    /// A reference from a parent chunk.
    pub fn chunk(parent: &ChunkHash, chunk: ChunkHash) -> Self {
        Self::new(SourceKind::Chunk, parent.as_str(), chunk)
    }

    /// A reference held by a named object.
    pub fn semantic(name: impl Into<String>, chunk: ChunkHash) -> Self {
        Self::new(SourceKind::Semantic, name, chunk)
    }
}

/// Textual form `kind:source:chunk`. The source may itself contain `:`.
impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.source, self.chunk)
    }
}

impl FromStr for Reference {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let (kind, rest) = s.split_once(':').ok_or_else(|| {
            crate::Error::InvalidReference(format!("expected kind:source:chunk, got {s:?}"))
        })?;
        let (source, chunk) = rest.rsplit_once(':').ok_or_else(|| {
            crate::Error::InvalidReference(format!("expected kind:source:chunk, got {s:?}"))
        })?;
        if source.is_empty() {
            return Err(crate::Error::InvalidReference(format!(
                "empty source in {s:?}"
            )));
        }
        Ok(Self::new(kind.parse()?, source, chunk.parse()?))
    }
}

/// Input of the reference-update protocol.
///
/// `add` is applied before any removal, and a reference listed in `add` is
/// never removed by the same update.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceUpdate {
    /// References to insert.
    #[serde(default)]
    pub add: Vec<Reference>,
    /// References to delete individually.
    #[serde(default)]
    pub remove: Vec<Reference>,
    /// Job whose every `job` reference is released.
    #[serde(default)]
    pub release_job: Option<String>,
}

impl ReferenceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, reference: Reference) -> Self {
        self.add.push(reference);
        self
    }

    pub fn remove(mut self, reference: Reference) -> Self {
        self.remove.push(reference);
        self
    }

    pub fn release_job(mut self, job: impl Into<String>) -> Self {
        self.release_job = Some(job.into());
        self
    }

    /// True when the update neither adds nor removes anything.
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.release_job.is_none()
    }

    /// True when the update can remove references and so re-evaluate chunks.
    pub fn has_removals(&self) -> bool {
        !self.remove.is_empty() || self.release_job.is_some()
    }
}
