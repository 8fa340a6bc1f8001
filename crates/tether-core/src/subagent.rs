//! Dependent (subagent) run management.
//!
//! Dependent runs are registered by the parent's stream, fed either from the
//! parent's raw output (events tagged with the dependent identity) or from a
//! broker fallback subscription that begins at registration time. Events that
//! arrive before registration wait in a small bounded buffer. After a host
//! restart, dependent runs rehydrate from the on-disk index and event log,
//! with status derived from the authoritative outcome registry.

use crate::config::EngineConfig;
use crate::persist::PersistenceWriter;
use crate::registry::RunRegistry;
use crate::run::Run;
use crate::store::{derive_status, RunIndexEntry, RunOutcome};
use crate::transform::EventTransformer;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tether_gateway::GatewayClient;
use tether_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tether_types::{parse_raw_value, RawEvent, RawPayload, RunStatus};
use tokio::sync::mpsc;
use tracing::{debug, warn, Level};

/// Events tolerated per identity while registration races behind delivery.
const PENDING_BUFFER_LIMIT: usize = 64;

#[derive(Debug, Clone)]
pub struct SubagentSpec {
    pub identity: String,
    pub run_id: String,
    pub parent: String,
    pub task: Option<String>,
    pub label: Option<String>,
}

struct SubagentState {
    /// parent identity -> dependent identities (the reverse index)
    children: HashMap<String, HashSet<String>>,
    /// live driver inboxes by dependent identity
    inboxes: HashMap<String, mpsc::UnboundedSender<RawEvent>>,
    /// pre-registration buffers by dependent identity
    pending: HashMap<String, VecDeque<RawEvent>>,
}

#[derive(Clone)]
pub struct SubagentRunManager {
    registry: Arc<RunRegistry>,
    persist: PersistenceWriter,
    gateway: GatewayClient,
    config: EngineConfig,
    state: Arc<Mutex<SubagentState>>,
}

impl SubagentRunManager {
    pub fn new(
        registry: Arc<RunRegistry>,
        persist: PersistenceWriter,
        gateway: GatewayClient,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            persist,
            gateway,
            config,
            state: Arc::new(Mutex::new(SubagentState {
                children: HashMap::new(),
                inboxes: HashMap::new(),
                pending: HashMap::new(),
            })),
        }
    }

    /// Register a dependent run. Idempotent: a known identity is a no-op and
    /// returns the existing run. Any buffered pre-registration events are
    /// replayed in order once the driver is wired up.
    pub async fn register(&self, spec: SubagentSpec) -> anyhow::Result<Arc<Run>> {
        if let Some(existing) = self.registry.get(&spec.identity) {
            return Ok(existing);
        }

        let run = Run::new(
            spec.identity.clone(),
            Some(spec.parent.clone()),
            spec.run_id.clone(),
            self.config.persist_debounce(),
        );
        self.registry.insert(run.clone());

        if let Err(err) = self
            .persist
            .store()
            .upsert_run(RunIndexEntry {
                identity: spec.identity.clone(),
                run_id: spec.run_id.clone(),
                message_id: run.message_id.clone(),
                parent: Some(spec.parent.clone()),
                task: spec.task.clone(),
                label: spec.label.clone(),
                status: RunStatus::Running,
                started_at: run.started_at(),
                ended_at: None,
                last_seq: 0,
                records: 0,
            })
            .await
        {
            warn!("failed to index dependent run {}: {err}", spec.identity);
        }

        self.attach(&run);

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "subagent.registered",
                component: "engine.subagent",
                identity: Some(&spec.identity),
                run_id: Some(&spec.run_id),
                parent: Some(&spec.parent),
                status: Some("running"),
                error_code: None,
                detail: spec.task.as_deref(),
            },
        );

        Ok(run)
    }

    /// Route a raw event tagged with a dependent identity. Unregistered
    /// identities buffer up to the pending limit; older events fall off the
    /// front.
    pub fn route(&self, raw: RawEvent) {
        let Some(identity) = raw.session_key.clone() else {
            return;
        };
        let mut state = self.state.lock();
        if let Some(inbox) = state.inboxes.get(&identity) {
            if inbox.send(raw).is_ok() {
                return;
            }
            // stale inbox from a finished driver
            state.inboxes.remove(&identity);
            return;
        }
        let queue = state.pending.entry(identity).or_default();
        if queue.len() >= PENDING_BUFFER_LIMIT {
            queue.pop_front();
        }
        queue.push_back(raw);
    }

    /// True while any dependent of `parent` is still live in the registry.
    pub fn has_live_children(&self, parent: &str) -> bool {
        let children = {
            let state = self.state.lock();
            state.children.get(parent).cloned().unwrap_or_default()
        };
        children.iter().any(|id| self.registry.has_running(id))
    }

    pub fn children_of(&self, parent: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .children
            .get(parent)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rebuild dependent runs from disk after a host restart. Live runs get
    /// a fresh driver and broker subscription; finished runs come back for
    /// replay only. Returns how many runs were rehydrated.
    pub async fn rehydrate(&self) -> anyhow::Result<usize> {
        let store = self.persist.store();
        let mut count = 0;
        for entry in store.list_runs().await {
            let Some(parent) = entry.parent.clone() else {
                continue;
            };
            if self.registry.get(&entry.identity).is_some() {
                continue;
            }

            let outcome = store.outcome(&entry.run_id).await;
            let status = derive_status(outcome.as_ref());
            let buffer = store.load_events(&entry.identity).await.unwrap_or_default();
            let parts = store
                .messages(&entry.identity)
                .await
                .into_iter()
                .find(|message| message.id == entry.message_id)
                .map(|message| message.parts)
                .unwrap_or_default();

            let run = Run::rehydrated(
                entry.identity.clone(),
                Some(parent.clone()),
                entry.run_id.clone(),
                entry.message_id.clone(),
                status,
                buffer,
                parts,
                entry.last_seq,
                self.config.persist_debounce(),
            );
            self.registry.insert(run.clone());
            self.state
                .lock()
                .children
                .entry(parent)
                .or_default()
                .insert(entry.identity.clone());

            if status.is_live() {
                self.attach(&run);
            } else {
                run.schedule_eviction(self.config.subagent_grace(), self.registry.clone());
            }
            count += 1;
        }
        Ok(count)
    }

    /// Wire a live dependent run: reverse index, driver inbox, broker
    /// fallback subscription, and replay of any pre-registration buffer.
    fn attach(&self, run: &Arc<Run>) {
        let identity = run.identity.clone();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (gateway_tx, gateway_rx) = mpsc::unbounded_channel();
        // Fallback subscription begins at registration; while the parent
        // process is still streaming, dedupe drops the overlap.
        let guard = self.gateway.subscribe(&identity, gateway_tx);
        run.set_gateway_guard(guard);

        let buffered = {
            let mut state = self.state.lock();
            if let Some(parent) = run.parent.clone() {
                state.children.entry(parent).or_default().insert(identity.clone());
            }
            state.inboxes.insert(identity.clone(), inbox_tx.clone());
            state.pending.remove(&identity)
        };
        if let Some(queue) = buffered {
            for raw in queue {
                let _ = inbox_tx.send(raw);
            }
        }

        let manager = self.clone();
        let run = run.clone();
        tokio::spawn(async move {
            manager.drive(run, inbox_rx, gateway_rx).await;
        });
    }

    /// Event-handling loop for one dependent run: the only mutator of its
    /// state, whichever source the events arrive from.
    async fn drive(
        &self,
        run: Arc<Run>,
        mut inbox: mpsc::UnboundedReceiver<RawEvent>,
        mut gateway_events: mpsc::UnboundedReceiver<serde_json::Value>,
    ) {
        let mut transformer = EventTransformer::new(run.clone(), self.persist.clone());
        let mut gateway_open = true;
        loop {
            tokio::select! {
                item = inbox.recv() => {
                    let Some(raw) = item else { break };
                    if self.handle_child_event(&run, &mut transformer, raw).await {
                        break;
                    }
                }
                item = gateway_events.recv(), if gateway_open => {
                    match item {
                        Some(value) => {
                            if let Some(raw) = parse_raw_value(value) {
                                if self.handle_child_event(&run, &mut transformer, raw).await {
                                    break;
                                }
                            }
                        }
                        // guard dropped; the inbox alone decides the end
                        None => gateway_open = false,
                    }
                }
            }
        }
        self.state.lock().inboxes.remove(&run.identity);
    }

    /// Apply one event; returns true when the run reached a terminal state.
    async fn handle_child_event(
        &self,
        run: &Arc<Run>,
        transformer: &mut EventTransformer,
        raw: RawEvent,
    ) -> bool {
        if run.status().is_terminal() {
            return true;
        }
        if !run.accept_seq(raw.seq) {
            return false;
        }
        let terminal = match &raw.payload {
            RawPayload::LifecycleEnd => Some((RunStatus::Completed, None)),
            RawPayload::LifecycleError { message } => {
                Some((RunStatus::Error, Some(message.clone())))
            }
            _ => None,
        };
        transformer.handle(&raw);
        if let Some((status, error)) = terminal {
            self.finalize(run, status, error).await;
            return true;
        }
        false
    }

    /// Mirror of the parent finalization path, with the (much longer)
    /// dependent grace period.
    async fn finalize(&self, run: &Arc<Run>, status: RunStatus, error: Option<String>) {
        run.take_gateway_guard();
        if !run.set_terminal(status) {
            return;
        }
        self.persist.flush(run).await;
        if let Err(err) = self
            .persist
            .store()
            .set_outcome(
                &run.run_id,
                RunOutcome {
                    exit_ok: status == RunStatus::Completed,
                    error,
                },
            )
            .await
        {
            warn!("failed to record outcome for {}: {err}", run.identity);
        }
        run.drain_subscribers();
        run.schedule_eviction(self.config.subagent_grace(), self.registry.clone());
        debug!("dependent run {} finalized as {status}", run.identity);

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "subagent.finalized",
                component: "engine.subagent",
                identity: Some(&run.identity),
                run_id: Some(&run.run_id),
                parent: run.parent.as_deref(),
                status: Some(if status == RunStatus::Completed {
                    "completed"
                } else {
                    "error"
                }),
                error_code: None,
                detail: None,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RunStore;
    use serde_json::json;
    use std::time::Duration;
    use tether_gateway::GatewayConfig;

    struct Harness {
        _dir: tempfile::TempDir,
        registry: Arc<RunRegistry>,
        store: Arc<RunStore>,
        manager: SubagentRunManager,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::new(dir.path()).await.unwrap());
        let registry = RunRegistry::new();
        let mut config = EngineConfig::default();
        config.persist_debounce_ms = 20;
        config.subagent_grace_ms = 60 * 1000;
        let manager = SubagentRunManager::new(
            registry.clone(),
            PersistenceWriter::new(store.clone()),
            GatewayClient::new(GatewayConfig::default()),
            config,
        );
        Harness {
            _dir: dir,
            registry,
            store,
            manager,
        }
    }

    fn spec(identity: &str, run_id: &str, parent: &str) -> SubagentSpec {
        SubagentSpec {
            identity: identity.to_string(),
            run_id: run_id.to_string(),
            parent: parent.to_string(),
            task: Some("investigate".to_string()),
            label: Some("investigator".to_string()),
        }
    }

    fn raw(identity: &str, seq: u64, stream: &str, data: serde_json::Value) -> RawEvent {
        parse_raw_value(json!({
            "event": "agent",
            "stream": stream,
            "sessionKey": identity,
            "globalSeq": seq,
            "data": data,
        }))
        .expect("test event must parse")
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    async fn wait_for_outcome(store: &Arc<RunStore>, run_id: &str) -> RunOutcome {
        for _ in 0..100 {
            if let Some(outcome) = store.outcome(run_id).await {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no outcome recorded for {run_id}");
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let h = harness().await;
        let first = h.manager.register(spec("p:c1", "r1", "p")).await.unwrap();
        let second = h.manager.register(spec("p:c1", "r-other", "p")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(h.manager.children_of("p"), vec!["p:c1".to_string()]);
    }

    #[tokio::test]
    async fn events_flow_through_to_completion() {
        let h = harness().await;
        let run = h.manager.register(spec("p:c1", "r1", "p")).await.unwrap();
        assert!(h.manager.has_live_children("p"));

        h.manager
            .route(raw("p:c1", 1, "assistant", json!({"text": "child output"})));
        h.manager
            .route(raw("p:c1", 2, "lifecycle", json!({"phase": "end"})));

        wait_until(|| run.status() == RunStatus::Completed).await;
        assert!(!h.manager.has_live_children("p"));
        assert_eq!(run.snapshot_message().content, "child output");
        assert!(wait_for_outcome(&h.store, "r1").await.exit_ok);
    }

    #[tokio::test]
    async fn pre_registration_events_replay_in_order() {
        let h = harness().await;
        h.manager
            .route(raw("p:c1", 1, "assistant", json!({"text": "early "})));
        h.manager
            .route(raw("p:c1", 2, "assistant", json!({"text": "bird"})));

        let run = h.manager.register(spec("p:c1", "r1", "p")).await.unwrap();
        wait_until(|| run.snapshot_message().content == "early bird").await;
    }

    #[tokio::test]
    async fn pre_registration_buffer_is_bounded() {
        let h = harness().await;
        for seq in 0..(PENDING_BUFFER_LIMIT as u64 + 10) {
            h.manager.route(raw(
                "p:c1",
                seq + 1,
                "assistant",
                json!({"text": format!("{seq} ")}),
            ));
        }
        let buffered = {
            let state = h.manager.state.lock();
            state.pending.get("p:c1").unwrap().len()
        };
        assert_eq!(buffered, PENDING_BUFFER_LIMIT);
    }

    #[tokio::test]
    async fn duplicate_sequence_numbers_are_dropped() {
        let h = harness().await;
        let run = h.manager.register(spec("p:c1", "r1", "p")).await.unwrap();

        h.manager
            .route(raw("p:c1", 1, "assistant", json!({"text": "once"})));
        h.manager
            .route(raw("p:c1", 1, "assistant", json!({"text": "once"})));
        h.manager
            .route(raw("p:c1", 2, "lifecycle", json!({"phase": "end"})));

        wait_until(|| run.status() == RunStatus::Completed).await;
        assert_eq!(run.snapshot_message().content, "once");
    }

    #[tokio::test]
    async fn lifecycle_error_finalizes_as_error() {
        let h = harness().await;
        let run = h.manager.register(spec("p:c1", "r1", "p")).await.unwrap();
        h.manager.route(raw(
            "p:c1",
            1,
            "lifecycle",
            json!({"phase": "error", "message": "child crashed"}),
        ));

        wait_until(|| run.status() == RunStatus::Error).await;
        let outcome = wait_for_outcome(&h.store, "r1").await;
        assert_eq!(outcome.error.as_deref(), Some("child crashed"));
        assert_eq!(run.snapshot_message().content, "child crashed");
    }

    #[tokio::test]
    async fn rehydration_restores_runs_with_derived_status() {
        let dir = tempfile::tempdir().unwrap();
        let registry_before = RunRegistry::new();
        let store = Arc::new(RunStore::new(dir.path()).await.unwrap());
        let mut config = EngineConfig::default();
        config.persist_debounce_ms = 20;
        let manager_before = SubagentRunManager::new(
            registry_before.clone(),
            PersistenceWriter::new(store.clone()),
            GatewayClient::new(GatewayConfig::default()),
            config.clone(),
        );

        // one finished child, one still running at "crash" time
        let done = manager_before
            .register(spec("p:done", "r-done", "p"))
            .await
            .unwrap();
        manager_before.route(raw("p:done", 1, "assistant", json!({"text": "finished work"})));
        manager_before.route(raw("p:done", 2, "lifecycle", json!({"phase": "end"})));
        wait_until(|| done.status() == RunStatus::Completed).await;
        wait_for_outcome(&store, "r-done").await;

        let live = manager_before
            .register(spec("p:live", "r-live", "p"))
            .await
            .unwrap();
        manager_before.route(raw("p:live", 1, "assistant", json!({"text": "in flight"})));
        wait_until(|| !live.snapshot_message().content.is_empty()).await;
        manager_before.persist.flush(&live).await;

        // fresh registry and manager, same disk: the restart
        let registry_after = RunRegistry::new();
        let store_after = Arc::new(RunStore::new(dir.path()).await.unwrap());
        let manager_after = SubagentRunManager::new(
            registry_after.clone(),
            PersistenceWriter::new(store_after),
            GatewayClient::new(GatewayConfig::default()),
            config,
        );
        let count = manager_after.rehydrate().await.unwrap();
        assert_eq!(count, 2);

        let done_run = registry_after.get("p:done").unwrap();
        assert_eq!(done_run.status(), RunStatus::Completed);
        let live_run = registry_after.get("p:live").unwrap();
        assert_eq!(live_run.status(), RunStatus::Running);
        assert_eq!(live_run.snapshot_message().content, "in flight");
        assert_eq!(live_run.last_seen_seq(), 1);
        assert!(manager_after.has_live_children("p"));

        // replayed history is served to new subscribers
        let mut sub = done_run.subscribe(true);
        let replayed = sub.drain_ready();
        assert!(!replayed.is_empty());

        // rehydration is itself idempotent
        assert_eq!(manager_after.rehydrate().await.unwrap(), 0);
    }
}
