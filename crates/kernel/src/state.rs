//! Application state shared across all handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::backend;
use crate::config::Config;
use crate::engine::Engine;
use crate::schema::DefaultSchema;

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: Engine,
}

impl AppState {
    /// Connect to the search backend and build the engine.
    pub async fn new(config: &Config) -> Result<Self> {
        let backend = backend::connect(config)
            .await
            .context("failed to connect to the search engine")?;
        info!(driver = backend.name(), "search backend ready");

        let engine = Engine::new(backend, config.engine.clone(), Arc::new(DefaultSchema::new()));
        Ok(Self::from_engine(engine))
    }

    /// Wrap an already built engine.
    pub fn from_engine(engine: Engine) -> Self {
        Self {
            inner: Arc::new(AppStateInner { engine }),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Whether the search backend answers.
    pub async fn engine_healthy(&self) -> bool {
        self.inner.engine.backend().ping().await
    }
}
