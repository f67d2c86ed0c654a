//! Keyed reuse cache.
//!
//! Maps `(fingerprint, caller key)` pairs to one database for the broker's
//! lifetime. Each pair has its own async mutex guarding its entry, so
//! creations for different pairs proceed concurrently while concurrent
//! requests for the same pair create exactly once.

use crate::metrics;
use cask_core::KeyedId;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

type Entry = Arc<Mutex<Option<String>>>;

/// Keyed database registry.
#[derive(Default)]
pub struct KeyedCache {
    /// Held only to look up or lazily create a pair's entry.
    entries: Mutex<HashMap<KeyedId, Entry>>,
    names: Mutex<HashSet<String>>,
}

impl KeyedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the database recorded for `id`, creating it with `create` if
    /// there is none yet. A failed creation records nothing.
    pub async fn get_or_create<F, Fut, E>(&self, id: &KeyedId, create: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let entry = {
            let mut entries = self.entries.lock().await;
            entries.entry(id.clone()).or_default().clone()
        };

        let mut database = entry.lock().await;
        if let Some(name) = database.as_ref() {
            debug!(key = %id, database = %name, "keyed database reused");
            metrics::KEYED_HITS.inc();
            return Ok(name.clone());
        }

        let name = create().await?;
        self.names.lock().await.insert(name.clone());
        *database = Some(name.clone());
        debug!(key = %id, database = %name, "keyed database recorded");
        Ok(name)
    }

    /// Whether `name` belongs to a keyed entry.
    pub async fn contains_database(&self, name: &str) -> bool {
        self.names.lock().await.contains(name)
    }

    /// Number of recorded keyed databases.
    pub async fn len(&self) -> usize {
        self.names.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
