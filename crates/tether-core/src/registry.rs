//! Process-wide run registry.
//!
//! A single keyed map from run identity to live run state. The global
//! instance lives behind an explicit accessor over a well-known static slot,
//! so re-initialization (e.g. a dev reload of the hosting module) reuses the
//! existing registry instead of orphaning running processes.

use crate::run::Run;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

static GLOBAL_REGISTRY: OnceLock<Arc<RunRegistry>> = OnceLock::new();

#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<String, Arc<Run>>>,
}

impl RunRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide registry. Idempotent: every call returns the same
    /// instance.
    pub fn global() -> Arc<Self> {
        GLOBAL_REGISTRY.get_or_init(Self::new).clone()
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Run>> {
        self.runs.read().get(identity).cloned()
    }

    pub fn insert(&self, run: Arc<Run>) {
        self.runs.write().insert(run.identity.clone(), run);
    }

    pub fn evict(&self, identity: &str) -> bool {
        self.runs.write().remove(identity).is_some()
    }

    /// True only while the run is `running` or `waiting-for-dependents`.
    pub fn has_running(&self, identity: &str) -> bool {
        self.get(identity)
            .map(|run| run.status().is_live())
            .unwrap_or(false)
    }

    pub fn running_identities(&self) -> Vec<String> {
        self.runs
            .read()
            .values()
            .filter(|run| run.status().is_live())
            .map(|run| run.identity.clone())
            .collect()
    }
}
