//! Shared database bootstrap and migration helpers.
//!
//! Domain tables (artifact records, access grants, jobs) are owned by
//! `chorus-engine`; this crate only provides the connection bootstrap and
//! the idempotency primitives every service's migrations are built from.

pub mod init;
pub mod migrations;

pub use init::connect;
