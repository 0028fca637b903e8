//! Artifact Store: content-addressed blobs + the transactional metadata
//! catalog, §4.1.
//!
//! Grounded on the teacher's `wkmp-ai::db` module (a `SqlitePool` wrapped by
//! focused per-entity query modules) combined with its `AppState`-level
//! `Arc<RwLock<HashMap<..>>>` idiom, here repurposed as a per-`source_id`
//! record lock rather than a cancellation-token map.

mod blobs;
mod catalog;
mod migrations;

pub use blobs::{BlobKind, BlobRef};
pub use catalog::{ArtifactStore, ListFilter};
pub use migrations::run_migrations;
