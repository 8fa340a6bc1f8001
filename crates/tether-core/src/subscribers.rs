//! Subscriber hub: the attach surface for observers.

use crate::registry::RunRegistry;
use crate::run::EventSubscription;
use std::sync::Arc;

/// Hands out per-run event subscriptions. Replay-then-live ordering is a
/// property of [`crate::run::Run::subscribe`]; this type only resolves the
/// identity.
#[derive(Clone)]
pub struct SubscriberHub {
    registry: Arc<RunRegistry>,
}

impl SubscriberHub {
    pub fn new(registry: Arc<RunRegistry>) -> Self {
        Self { registry }
    }

    /// Attach to a run. Returns `None` when no run exists for `identity`.
    /// With `replay`, the full buffered history is delivered synchronously
    /// before any live event; for a terminal run the stream closes right
    /// after the replayed prefix. Dropping the subscription unsubscribes.
    pub fn subscribe(&self, identity: &str, replay: bool) -> Option<EventSubscription> {
        Some(self.registry.get(identity)?.subscribe(replay))
    }
}
