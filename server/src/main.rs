#[macro_use]
extern crate log;

mod api;
mod auth;
mod clock;
mod config;
mod coordinator;
mod db;
mod error;
mod events;
mod fabric;
mod game;
mod locks;
mod premove;
mod rules;
mod server;
mod stats;
mod watcher;
mod ws;

#[cfg(test)]
mod test;

use std::fs::File;
use std::sync::Arc;

use anyhow::Context;

use crate::auth::{IdentityVerifier, TrustedTokenVerifier};
use crate::config::EnvironmentConfig;
use crate::coordinator::Coordinator;
use crate::db::game::GameStore;
use crate::db::Pool;
use crate::fabric::SessionFabric;
use crate::premove::PremoveQueue;
use crate::stats::LogStats;

/// Everything a handler needs, wired once at startup. No singletons: all of
/// these are plain values owned here and injected, so several servers can
/// coexist in one test process.
#[derive(Clone)]
pub struct AppState {
    pub config: EnvironmentConfig,
    pub store: Arc<GameStore>,
    pub fabric: Arc<SessionFabric>,
    pub coordinator: Arc<Coordinator>,
    pub verifier: Arc<dyn IdentityVerifier>,
}

fn init_logger(config: &EnvironmentConfig) -> anyhow::Result<()> {
    use simplelog::*;

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(
            LevelFilter::Debug,
            Config::default(),
            File::create(&config.log_file)
                .with_context(|| format!("could not create log file {}", config.log_file))?,
        ),
    ])?;

    debug!("logging initialized, debug level goes to {}", config.log_file);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config();
    init_logger(&config)?;

    let pool = Pool::new(&config.database_path)
        .await
        .context("could not open the database")?;
    sqlx::migrate!()
        .run(&pool.0)
        .await
        .context("could not run migrations")?;

    let verifier: Arc<dyn IdentityVerifier> = match &config.trusted_tokens_file {
        Some(path) => Arc::new(TrustedTokenVerifier::from_file(path).map_err(anyhow::Error::msg)?),
        None => Arc::new(TrustedTokenVerifier::permissive()),
    };

    let store = Arc::new(GameStore::new(pool));
    let fabric = Arc::new(SessionFabric::new());
    let premoves = Arc::new(PremoveQueue::new());
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        premoves,
        fabric.clone(),
        Arc::new(LogStats),
    ));

    watcher::spawn(coordinator.clone());

    let state = AppState {
        config,
        store,
        fabric,
        coordinator,
        verifier,
    };
    server::run(state).await;
    Ok(())
}
