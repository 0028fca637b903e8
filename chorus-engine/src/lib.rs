//! chorus-engine: the orchestration core (§2) plus a thin transport binary
//! over it (§6.1). Everything under [`routes`] is a collaborator — request
//! parsing and response shaping only, never business logic; the actual
//! dedup/scheduling/recovery semantics live in [`engine`] and the modules
//! it wires together.

pub mod access;
pub mod adapters;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod models;
pub mod queue;
pub mod recovery;
pub mod routes;
pub mod runners;
pub mod store;

pub use engine::{CancelOutcome, Engine, RequestOutcome};
pub use error::{ApiError, ApiResult};

use std::sync::Arc;

/// Shared application state handed to every axum handler. A single `Engine`
/// handle constructed at startup, per the §9 "global mutable state" redesign
/// note — handlers borrow it through `State`, they never reach for a
/// singleton.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// Builds the full HTTP router, one `merge` per feature area, mirroring the
/// teacher's `build_router` in `wkmp-ai::main`.
pub fn build_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .merge(routes::health::health_routes())
        .merge(routes::sources::source_routes())
        .merge(routes::jobs::job_routes())
        .merge(routes::grants::grant_routes())
        .merge(routes::events::event_routes())
        .with_state(state)
}
