//! # chorus-common
//!
//! Shared code used by the orchestration engine and its transport binary:
//! - Database bootstrap and migration helpers
//! - Error taxonomy shared across the Artifact Store, Deduplication Index,
//!   Access View and Job Queue
//! - The Progress Bus and its typed event payloads
//! - The SSE transport adapter
//! - Root-folder configuration resolution
//! - Timestamp utilities

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod sse;
pub mod time;

pub use error::{ClassifiedError, Error, ErrorKind, Result};
pub use events::{ProgressBus, ProgressEvent, ProgressEventBody, RoomId, Stage};
