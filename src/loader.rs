//! Configuration loading and registry reloads.
//!
//! A reload either installs a complete new generation or leaves the live
//! one untouched; a failed load is only reported.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ApiConfig, EndpointDefinition};
use crate::events::EventBus;
use crate::registry::{EndpointRegistry, Generation};

/// Errors loading a configuration source.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Where endpoint definitions come from.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Human readable location, used in log messages.
    fn describe(&self) -> String;

    /// Load the full list of endpoint definitions.
    async fn load(&self) -> Result<Vec<EndpointDefinition>, LoadError>;
}

/// YAML configuration file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EndpointSource for FileSource {
    fn describe(&self) -> String {
        std::path::absolute(&self.path)
            .unwrap_or_else(|_| self.path.clone())
            .display()
            .to_string()
    }

    async fn load(&self) -> Result<Vec<EndpointDefinition>, LoadError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound(self.path.clone()));
            }
            Err(source) => {
                return Err(LoadError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let config = ApiConfig::from_yaml(&content).map_err(|source| LoadError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(config.endpoints)
    }
}

/// Loads a source and installs the result into the registry.
pub struct ConfigReloader {
    source: Arc<dyn EndpointSource>,
    registry: Arc<EndpointRegistry>,
    events: EventBus,
}

impl ConfigReloader {
    pub fn new(
        source: Arc<dyn EndpointSource>,
        registry: Arc<EndpointRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            source,
            registry,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Reload the configuration.
    ///
    /// On failure the live generation keeps serving.
    pub async fn reload(&self) -> Result<Arc<Generation>, LoadError> {
        self.events
            .info(format!("Loading config from: {}", self.source.describe()));

        match self.source.load().await {
            Ok(endpoints) => Ok(self.registry.replace(endpoints)),
            Err(e) => {
                self.events.error(format!(
                    "Error loading config file: {} (keeping {} registered endpoints)",
                    e,
                    self.registry.current().len()
                ));
                Err(e)
            }
        }
    }
}
