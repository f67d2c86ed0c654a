//! Template build coordination.
//!
//! One record per fingerprint. The first requester spawns the build; every
//! requester, the first included, awaits the same shared settlement. A
//! settled record is replayed to all later requesters, failures included.
//! The single exception is [`ErrorKind::ContextVanished`]: such a record is
//! discarded so that the next requester builds again.

use cask_core::{ContextId, ErrorKind, Fingerprint, WireError};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A frozen template and the fixture hook result it was built with.
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateRecord {
    pub fingerprint: Fingerprint,
    pub template_name: String,
    pub hook_result: Value,
}

/// Outcome of one template build.
pub type BuildResult = Result<Arc<TemplateRecord>, WireError>;

type SharedBuild = Shared<BoxFuture<'static, BuildResult>>;

/// Observable state of a fingerprint's record.
#[derive(Clone, Debug, PartialEq)]
pub enum BuildState {
    Building,
    Ready(Arc<TemplateRecord>),
    Failed(WireError),
}

struct Slot {
    builder: ContextId,
    build: SharedBuild,
}

/// Deduplicates template builds per fingerprint.
#[derive(Default)]
pub struct TemplateCoordinator {
    slots: Mutex<HashMap<Fingerprint, Slot>>,
}

impl TemplateCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the template for `fingerprint`, building it with `build` if no
    /// record exists yet.
    ///
    /// `build` is called at most once per attempt, under the coordinator lock,
    /// and its future runs on its own task so it completes even if every
    /// requester goes away. When the building context vanished mid-build,
    /// requesters from other contexts start over transparently.
    pub async fn get_or_build<F>(
        &self,
        fingerprint: Fingerprint,
        context: ContextId,
        mut build: F,
    ) -> BuildResult
    where
        F: FnMut() -> BoxFuture<'static, BuildResult>,
    {
        loop {
            let (builder, shared) = {
                let mut slots = self.slots.lock().await;
                match slots.get(&fingerprint) {
                    Some(slot) => (slot.builder, slot.build.clone()),
                    None => {
                        debug!(fingerprint = %fingerprint.short(), context_id = %context, "starting template build");
                        let task = tokio::spawn(build());
                        let shared = async move {
                            match task.await {
                                Ok(result) => result,
                                Err(e) => Err(WireError::new(
                                    ErrorKind::TemplateBuild,
                                    format!("template build task failed: {e}"),
                                )),
                            }
                        }
                        .boxed()
                        .shared();
                        slots.insert(
                            fingerprint,
                            Slot {
                                builder: context,
                                build: shared.clone(),
                            },
                        );
                        (context, shared)
                    }
                }
            };

            let outcome = shared.clone().await;
            match outcome {
                Err(e) if e.kind == ErrorKind::ContextVanished => {
                    self.discard(fingerprint, &shared).await;
                    if builder == context {
                        return Err(e);
                    }
                    info!(
                        fingerprint = %fingerprint.short(),
                        builder = %builder,
                        "building context vanished, retrying template build"
                    );
                }
                other => return other,
            }
        }
    }

    /// Current state for `fingerprint`, if a record exists.
    pub async fn state(&self, fingerprint: &Fingerprint) -> Option<BuildState> {
        let slots = self.slots.lock().await;
        let slot = slots.get(fingerprint)?;
        Some(match slot.build.peek() {
            None => BuildState::Building,
            Some(Ok(record)) => BuildState::Ready(record.clone()),
            Some(Err(e)) => BuildState::Failed(e.clone()),
        })
    }

    /// Number of records (building, ready or failed).
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn discard(&self, fingerprint: Fingerprint, build: &SharedBuild) {
        let mut slots = self.slots.lock().await;
        if slots
            .get(&fingerprint)
            .is_some_and(|slot| slot.build.ptr_eq(build))
        {
            slots.remove(&fingerprint);
        }
    }
}
