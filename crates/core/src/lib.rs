//! Core domain types for the chunkref reference-counting garbage collector.
//!
//! This crate defines the data model shared by every other crate:
//! - Chunk identity (content hashes)
//! - Reference edges and their source kinds
//! - Reference updates (the input of the update protocol)
//! - Configuration

pub mod chunk;
pub mod config;
pub mod error;
pub mod reference;

pub use chunk::ChunkHash;
pub use error::{Error, Result};
pub use reference::{Reference, ReferenceUpdate, SourceKind};
