//! chorus-engine binary: resolves configuration, bootstraps the `Engine`
//! against its offline reference adapters, and serves the control surface
//! from `lib.rs::build_router`.
//!
//! A production deployment swaps [`chorus_engine::adapters::AdapterRegistry`]
//! for one wired to real fetch/separation/analysis backends; the bootstrap
//! and routing shape below don't change.

use chorus_engine::adapters::AdapterRegistry;
use chorus_engine::config::EngineConfig;
use chorus_engine::{build_router, AppState, Engine};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(name = "chorus-engine", version, about = "Music source orchestration engine")]
struct Cli {
    /// Root folder for the artifact store and catalog database.
    #[arg(long)]
    downloads_root: Option<PathBuf>,

    /// Address to bind the HTTP control surface to.
    #[arg(long, default_value = "127.0.0.1:8730")]
    bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    info!("starting chorus-engine");
    info!(version = env!("CARGO_PKG_VERSION"), "version");

    let config = EngineConfig::resolve(cli.downloads_root).await?;
    let adapters = AdapterRegistry::offline(&config.chord_backend_order);

    let engine = Engine::bootstrap(config, adapters).await?;
    let state = AppState::new(engine);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    info!(addr = %cli.bind, "listening");
    info!(addr = %cli.bind, "health check: http://{}/health", cli.bind);

    axum::serve(listener, app).await?;

    Ok(())
}
