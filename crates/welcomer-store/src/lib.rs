//! Welcomer Store - Artifact index
//!
//! Maps artifact identifiers to their [`ArtifactRecord`](welcomer_common::ArtifactRecord)
//! in an embedded redb database. The image files themselves live in a plain
//! folder; this crate only tracks which of them exist and when they expire.

pub mod store;
pub mod tables;

pub use store::{ArtifactStore, StoreError, StoreResult};
