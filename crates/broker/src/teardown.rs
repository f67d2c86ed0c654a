//! Per-context cleanup of owned databases.

use crate::keyed::KeyedCache;
use crate::metrics;
use cask_core::ContextId;
use cask_provision::DatabaseAdmin;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// How many quiet ended contexts are remembered for rejecting late requests.
const RECENTLY_ENDED: usize = 1024;

#[derive(Default)]
struct TeardownState {
    owned: HashMap<ContextId, Vec<String>>,
    /// Requests still running, per context.
    in_flight: HashMap<ContextId, usize>,
    /// Ended contexts that still have requests in flight.
    ended: HashSet<ContextId>,
    /// Ended contexts with nothing in flight, oldest first.
    recently_ended: VecDeque<ContextId>,
}

impl TeardownState {
    fn has_ended(&self, context: &ContextId) -> bool {
        self.ended.contains(context) || self.recently_ended.contains(context)
    }

    fn retire(&mut self, context: ContextId) {
        if self.recently_ended.len() == RECENTLY_ENDED {
            self.recently_ended.pop_front();
        }
        self.recently_ended.push_back(context);
    }
}

/// What one context's teardown did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub dropped: Vec<String>,
    /// Owned databases left alone because a keyed entry refers to them.
    pub kept_keyed: Vec<String>,
    /// `(database, error)` for every database that could not be dropped.
    pub failures: Vec<(String, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Tracks which non-keyed databases each calling context created.
#[derive(Default)]
pub struct TeardownTracker {
    state: Mutex<TeardownState>,
}

impl TeardownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TeardownState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count a request for `context` as running until the guard drops.
    ///
    /// An ended context stays marked as long as any of its requests run, so
    /// whatever they create afterwards is refused by [`Self::register_owned`].
    pub fn begin_request(&self, context: ContextId) -> RequestGuard<'_> {
        *self.state().in_flight.entry(context).or_default() += 1;
        RequestGuard {
            tracker: self,
            context,
        }
    }

    fn finish_request(&self, context: ContextId) {
        let mut state = self.state();
        let Some(count) = state.in_flight.get_mut(&context) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        state.in_flight.remove(&context);
        if state.ended.remove(&context) {
            state.retire(context);
        }
    }

    /// Record that `context` owns `database`.
    ///
    /// Returns `false` when the context has already ended; the caller must
    /// drop the database itself.
    pub async fn register_owned(&self, context: ContextId, database: &str) -> bool {
        let mut state = self.state();
        if state.has_ended(&context) {
            return false;
        }
        state
            .owned
            .entry(context)
            .or_default()
            .push(database.to_string());
        true
    }

    /// Databases currently owned by `context`.
    pub async fn owned_by(&self, context: ContextId) -> Vec<String> {
        self.state()
            .owned
            .get(&context)
            .cloned()
            .unwrap_or_default()
    }

    /// Mark `context` ended and drop every database it owns that no keyed
    /// entry refers to. A second call for the same context does nothing.
    pub async fn on_context_ended(
        &self,
        context: ContextId,
        admin: Option<&dyn DatabaseAdmin>,
        keyed: &KeyedCache,
    ) -> TeardownReport {
        let owned = {
            let mut state = self.state();
            if !state.has_ended(&context) {
                if state.in_flight.contains_key(&context) {
                    state.ended.insert(context);
                } else {
                    state.retire(context);
                }
            }
            state.owned.remove(&context).unwrap_or_default()
        };

        let mut report = TeardownReport::default();
        if owned.is_empty() {
            return report;
        }
        let Some(admin) = admin else {
            // Databases exist only once the admin connected.
            return report;
        };

        for database in owned {
            if keyed.contains_database(&database).await {
                report.kept_keyed.push(database);
                continue;
            }
            match drop_database(admin, &database).await {
                Ok(()) => {
                    metrics::DATABASES_DROPPED.inc();
                    report.dropped.push(database);
                }
                Err(e) => {
                    metrics::DROP_FAILURES.inc();
                    warn!(context_id = %context, database = %database, error = %e, "failed to drop database");
                    report.failures.push((database, e));
                }
            }
        }

        info!(
            context_id = %context,
            dropped = report.dropped.len(),
            failures = report.failures.len(),
            "context torn down"
        );
        report
    }
}

/// Marks one request for a context as running; see
/// [`TeardownTracker::begin_request`].
pub struct RequestGuard<'a> {
    tracker: &'a TeardownTracker,
    context: ContextId,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.tracker.finish_request(self.context);
    }
}

/// Disconnect everyone from `database`, then drop it.
pub async fn drop_database(admin: &dyn DatabaseAdmin, database: &str) -> Result<(), String> {
    if let Err(e) = admin.force_disconnect(database).await {
        warn!(database = %database, error = %e, "failed to disconnect before drop");
    }
    admin.drop_database(database).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_core::{Fingerprint, KeyedId};
    use cask_provision::MemoryAdmin;

    #[tokio::test]
    async fn test_teardown_drops_owned_and_keeps_keyed() {
        let admin = MemoryAdmin::new();
        let keyed = KeyedCache::new();
        let tracker = TeardownTracker::new();
        let context = ContextId::new();

        for name in ["test_a", "test_b", "test_k"] {
            admin.create_database(name).await.unwrap();
            assert!(tracker.register_owned(context, name).await);
        }
        keyed
            .get_or_create(&KeyedId::new(Fingerprint::of(None), "k"), || async {
                Ok::<_, ()>("test_k".to_string())
            })
            .await
            .unwrap();

        let report = tracker.on_context_ended(context, Some(&admin), &keyed).await;
        assert_eq!(report.dropped, vec!["test_a", "test_b"]);
        assert_eq!(report.kept_keyed, vec!["test_k"]);
        assert!(report.is_clean());
        assert!(admin.database_exists("test_k").await.unwrap());
        assert!(!admin.database_exists("test_a").await.unwrap());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let admin = MemoryAdmin::new();
        let keyed = KeyedCache::new();
        let tracker = TeardownTracker::new();
        let context = ContextId::new();

        for name in ["test_a", "test_b", "test_c"] {
            admin.create_database(name).await.unwrap();
            tracker.register_owned(context, name).await;
        }
        admin.fail_drops_of("test_b").await;

        let report = tracker.on_context_ended(context, Some(&admin), &keyed).await;
        assert_eq!(report.dropped, vec!["test_a", "test_c"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "test_b");
    }

    #[tokio::test]
    async fn test_second_end_and_late_registration() {
        let admin = MemoryAdmin::new();
        let keyed = KeyedCache::new();
        let tracker = TeardownTracker::new();
        let context = ContextId::new();

        admin.create_database("test_a").await.unwrap();
        tracker.register_owned(context, "test_a").await;
        tracker.on_context_ended(context, Some(&admin), &keyed).await;

        let again = tracker.on_context_ended(context, Some(&admin), &keyed).await;
        assert_eq!(again, TeardownReport::default());
        assert!(!tracker.register_owned(context, "test_late").await);
        assert!(tracker.owned_by(context).await.is_empty());
    }

    #[tokio::test]
    async fn test_ended_markers_stay_bounded() {
        let keyed = KeyedCache::new();
        let tracker = TeardownTracker::new();

        for _ in 0..10_000 {
            tracker.on_context_ended(ContextId::new(), None, &keyed).await;
        }
        let state = tracker.state();
        assert!(state.ended.is_empty());
        assert_eq!(state.recently_ended.len(), RECENTLY_ENDED);
    }

    #[tokio::test]
    async fn test_in_flight_request_keeps_context_marked() {
        let keyed = KeyedCache::new();
        let tracker = TeardownTracker::new();
        let context = ContextId::new();

        let request = tracker.begin_request(context);
        tracker.on_context_ended(context, None, &keyed).await;
        for _ in 0..RECENTLY_ENDED * 2 {
            tracker.on_context_ended(ContextId::new(), None, &keyed).await;
        }
        assert!(!tracker.register_owned(context, "test_late").await);

        drop(request);
        {
            let state = tracker.state();
            assert!(state.ended.is_empty());
            assert!(state.in_flight.is_empty());
        }
        assert!(!tracker.register_owned(context, "test_later").await);
    }

    #[tokio::test]
    async fn test_finished_requests_leave_nothing_behind() {
        let tracker = TeardownTracker::new();
        let context = ContextId::new();

        let first = tracker.begin_request(context);
        let second = tracker.begin_request(context);
        drop(first);
        assert_eq!(tracker.state().in_flight.get(&context), Some(&1));
        drop(second);
        assert!(tracker.state().in_flight.is_empty());
        assert!(tracker.register_owned(context, "test_a").await);
    }
}
