//! [`BackendConnector`] backed by Manager processes.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use lens3_core::Lens3Config;
use lens3_registry::{BackendAdmin, BackendConnector, McAdmin, RegistryError, RegistryResult};
use lens3_state::Tables;
use tracing::debug;

use crate::spawner::Spawner;

/// Finds a pool's running backend, starting one through a Manager when
/// none is published.
pub struct Activator {
    tables: Tables,
    spawner: Spawner,
    mc: PathBuf,
    mc_timeout: Duration,
}

impl Activator {
    pub fn new(tables: Tables, spawner: Spawner, config: &Lens3Config) -> Self {
        Self {
            tables,
            spawner,
            mc: config.manager.mc.clone(),
            mc_timeout: config.manager.mc_timeout(),
        }
    }
}

#[async_trait]
impl BackendConnector for Activator {
    async fn activate(&self, pool_id: &str) -> RegistryResult<String> {
        if let Some(endpoint) = self.tables.get_endpoint(pool_id).await? {
            debug!(%pool_id, %endpoint, "backend already running");
            return Ok(endpoint);
        }
        Ok(self.spawner.spawn(pool_id).await?)
    }

    async fn connect(&self, pool_id: &str) -> RegistryResult<Box<dyn BackendAdmin>> {
        let endpoint = self.activate(pool_id).await?;
        let process = self
            .tables
            .get_process(pool_id)
            .await?
            .ok_or_else(|| RegistryError::unavailable(format!("Backend record missing: {pool_id}")))?;
        let admin = McAdmin::open(
            &self.mc,
            &endpoint,
            &process.admin,
            &process.password,
            pool_id,
            self.mc_timeout,
        )
        .await?;
        Ok(Box::new(admin))
    }
}
