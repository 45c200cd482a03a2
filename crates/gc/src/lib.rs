//! Reference-counting garbage collection for chunkref.
//!
//! Callers reserve chunks for jobs and move references between sources
//! through a [`GcClient`]. Chunks whose last reference disappears are handed
//! to a [`ChunkServer`], which removes their content and rows.

pub mod client;
pub mod error;
pub mod server;

pub use chunkref_metadata::OpContext;
pub use client::{GcClient, StoreClient};
pub use error::{GcError, GcResult, ServerError, ServerResult};
pub use server::{ChunkServer, StorageServer};
