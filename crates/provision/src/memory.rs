//! In-memory database administration for tests and dry runs.

use crate::admin::DatabaseAdmin;
use crate::error::{ProvisionError, ProvisionResult};
use async_trait::async_trait;
use cask_core::names::validate_identifier;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone, Debug, Default)]
struct MemoryDatabase {
    is_template: bool,
    open_connections: u32,
    connect_allowed: bool,
}

#[derive(Default)]
struct MemoryAdminState {
    databases: BTreeMap<String, MemoryDatabase>,
    failing_drops: HashSet<String>,
    clones: u64,
    drops: Vec<String>,
    disconnects: Vec<String>,
    clone_delay: Duration,
    unhealthy: bool,
}

/// A [`DatabaseAdmin`] that keeps databases in a map.
///
/// Behaves like the server for the operations the broker relies on: clones
/// fail while their template has open connections, drops tolerate missing
/// databases, templates cannot be converted back.
#[derive(Default)]
pub struct MemoryAdmin {
    state: Mutex<MemoryAdminState>,
}

impl MemoryAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a client connected to `name`.
    pub async fn open_connection(&self, name: &str) -> ProvisionResult<()> {
        let mut state = self.state.lock().await;
        let db = state
            .databases
            .get_mut(name)
            .ok_or_else(|| ProvisionError::NotFound(name.to_string()))?;
        if !db.connect_allowed {
            return Err(ProvisionError::Internal(format!(
                "permission denied for database {name}"
            )));
        }
        db.open_connections += 1;
        Ok(())
    }

    /// Make every drop of `name` fail.
    pub async fn fail_drops_of(&self, name: &str) {
        self.state.lock().await.failing_drops.insert(name.to_string());
    }

    /// Delay each clone, widening race windows in concurrency tests.
    pub async fn set_clone_delay(&self, delay: Duration) {
        self.state.lock().await.clone_delay = delay;
    }

    pub async fn set_unhealthy(&self, unhealthy: bool) {
        self.state.lock().await.unhealthy = unhealthy;
    }

    /// Number of successful clones.
    pub async fn clone_count(&self) -> u64 {
        self.state.lock().await.clones
    }

    /// Databases dropped so far, in order.
    pub async fn dropped(&self) -> Vec<String> {
        self.state.lock().await.drops.clone()
    }

    /// Databases force-disconnected so far, in order.
    pub async fn disconnected(&self) -> Vec<String> {
        self.state.lock().await.disconnects.clone()
    }

    pub async fn is_template(&self, name: &str) -> bool {
        self.state
            .lock()
            .await
            .databases
            .get(name)
            .is_some_and(|db| db.is_template)
    }
}

#[async_trait]
impl DatabaseAdmin for MemoryAdmin {
    async fn create_database(&self, name: &str) -> ProvisionResult<()> {
        validate_identifier(name)?;
        let mut state = self.state.lock().await;
        if state.databases.contains_key(name) {
            return Err(ProvisionError::AlreadyExists(name.to_string()));
        }
        state.databases.insert(
            name.to_string(),
            MemoryDatabase {
                connect_allowed: true,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn create_from_template(&self, name: &str, template: &str) -> ProvisionResult<()> {
        validate_identifier(name)?;
        validate_identifier(template)?;

        let delay = self.state.lock().await.clone_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        match state.databases.get(template) {
            None => return Err(ProvisionError::NotFound(template.to_string())),
            Some(source) if source.open_connections > 0 => {
                return Err(ProvisionError::SourceBusy(template.to_string()));
            }
            Some(_) => {}
        }
        if state.databases.contains_key(name) {
            return Err(ProvisionError::AlreadyExists(name.to_string()));
        }
        state.databases.insert(
            name.to_string(),
            MemoryDatabase {
                connect_allowed: true,
                ..Default::default()
            },
        );
        state.clones += 1;
        Ok(())
    }

    async fn force_disconnect(&self, name: &str) -> ProvisionResult<()> {
        validate_identifier(name)?;
        let mut state = self.state.lock().await;
        if let Some(db) = state.databases.get_mut(name) {
            db.connect_allowed = false;
            db.open_connections = 0;
        }
        state.disconnects.push(name.to_string());
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> ProvisionResult<()> {
        validate_identifier(name)?;
        let mut state = self.state.lock().await;
        if state.failing_drops.contains(name) {
            return Err(ProvisionError::Internal(format!(
                "could not drop database {name}"
            )));
        }
        if let Some(db) = state.databases.get(name) {
            if db.open_connections > 0 {
                return Err(ProvisionError::SourceBusy(name.to_string()));
            }
            state.databases.remove(name);
            state.drops.push(name.to_string());
        }
        Ok(())
    }

    async fn convert_to_template(&self, name: &str) -> ProvisionResult<()> {
        let mut state = self.state.lock().await;
        let db = state
            .databases
            .get_mut(name)
            .ok_or_else(|| ProvisionError::NotFound(name.to_string()))?;
        db.is_template = true;
        Ok(())
    }

    async fn database_exists(&self, name: &str) -> ProvisionResult<bool> {
        Ok(self.state.lock().await.databases.contains_key(name))
    }

    async fn list_databases(&self, is_template: bool) -> ProvisionResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .databases
            .iter()
            .filter(|(_, db)| db.is_template == is_template)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn health_check(&self) -> ProvisionResult<()> {
        if self.state.lock().await.unhealthy {
            return Err(ProvisionError::Internal("server unavailable".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {}
}
