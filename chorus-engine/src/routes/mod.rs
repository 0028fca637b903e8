//! The control surface (§6.1): one module per resource, mirroring the
//! teacher's per-feature `*_routes() -> Router` convention.

pub mod events;
pub mod grants;
pub mod health;
pub mod identity;
pub mod jobs;
pub mod sources;
