//! Redb table definitions for the artifact index.

use redb::TableDefinition;

/// Artifact id → JSON(ArtifactRecord)
pub const IMAGES: TableDefinition<&str, &str> = TableDefinition::new("images");
