//! Repository traits for the reference store.

pub mod refs;

pub use refs::{BoxError, ContentRemover, RefRepo};
