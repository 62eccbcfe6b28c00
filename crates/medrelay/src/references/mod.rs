//! Citation handling for the no-references relay mode

pub mod cache;
pub mod splitter;

pub use cache::ReferenceCache;
pub use splitter::{ReferenceSplitter, split_references};
