use anyhow::Context;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::config::FleetConfig;
use crate::db::registry::Registry;
use crate::docker::{ContainerRuntime, DockerRuntime};

pub type SharedState = Arc<FleetState>;

pub struct FleetState {
    pub config: FleetConfig,
    pub registry: Registry,
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Shared by instance operations, exclusive for snapshot and restore.
    pub fleet_lock: RwLock<()>,
    /// Serializes every registry read -> manifest write -> registry mutation.
    pub manifest_lock: Mutex<()>,
}

impl FleetState {
    pub fn new(
        config: FleetConfig,
        registry: Registry,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> SharedState {
        Arc::new(Self {
            config,
            registry,
            runtime,
            fleet_lock: RwLock::new(()),
            manifest_lock: Mutex::new(()),
        })
    }

    /// Open the registry under `config.root_dir` and wire up the docker runtime.
    pub fn open(config: FleetConfig) -> anyhow::Result<SharedState> {
        let db_path = config.database_path();
        let registry = Registry::open(&db_path)
            .with_context(|| format!("failed to open registry at {}", db_path.display()))?;
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(&config));
        tracing::info!(
            "fleet root {} (registry {})",
            config.root_dir.display(),
            db_path.display()
        );
        Ok(Self::new(config, registry, runtime))
    }
}
