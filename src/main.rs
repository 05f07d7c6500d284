use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use switchboard::analytics::{AnalyticsCache, GeminiAnalytics};
use switchboard::config::Config;
use switchboard::fanout::{self, SupervisorRegistry};
use switchboard::gateway::{self, AppState};
use switchboard::session::manager::SessionManager;
use switchboard::session::runner::SessionDeps;
use switchboard::store::{start_writer, SummaryStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_env()?);

    let default_filter = if config.debug {
        "switchboard=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!(
        voice_model = %config.voice_model,
        analysis_model = %config.analysis_model,
        "Starting switchboard"
    );

    // Start order: persistence → registry/fan-out → control surface.
    let store = Arc::new(
        SummaryStore::open(&config.db_path)
            .with_context(|| format!("Opening summary store at {}", config.db_path.display()))?,
    );
    let (writer, _writer_task) = start_writer(Arc::clone(&store), 64);

    let registry = Arc::new(SupervisorRegistry::new());
    let (fanout_handle, _fanout_task) = fanout::start(Arc::clone(&registry));

    let backend = Arc::new(GeminiAnalytics::new(
        config.api_key.clone(),
        config.analysis_model.clone(),
    ));
    let cache = Arc::new(AnalyticsCache::new());

    let manager = SessionManager::new(SessionDeps {
        config: Arc::clone(&config),
        fanout: fanout_handle,
        backend: backend.clone(),
        cache: Arc::clone(&cache),
        writer,
        connect_ai: true,
    });

    gateway::run(AppState {
        config,
        manager,
        registry,
        store,
        backend,
        cache,
    })
    .await
}
