//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::route_planner::RouteEngine;
use crate::terrain::{ElevationConfig, ElevationService};
use crate::tiles::HttpTileSource;

pub struct AppState {
    config: Config,
    engine: RouteEngine,
}

impl AppState {
    /// State backed by the configured HTTP tile server.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let key = Some(config.terrain_key.clone());
        let source = HttpTileSource::new(
            config.terrain_url.clone(),
            key,
            Duration::from_secs(config.terrain_timeout_s),
        )?;
        let elevation = ElevationService::new(Arc::new(source), ElevationConfig::from(&config));
        let engine = RouteEngine::from_config(elevation, &config);
        Ok(Self::with_engine(config, engine))
    }

    pub fn with_engine(config: Config, engine: RouteEngine) -> Self {
        Self { config, engine }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &RouteEngine {
        &self.engine
    }
}
