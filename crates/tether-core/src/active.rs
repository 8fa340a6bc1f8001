//! Parent run orchestration: start, abort, status, and the
//! waiting-for-dependents handoff.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::persist::PersistenceWriter;
use crate::process::{ProcessEvent, ProcessHandle, ProcessSpec, ProcessSupervisor};
use crate::registry::RunRegistry;
use crate::run::Run;
use crate::store::{RunIndexEntry, RunOutcome};
use crate::subagent::SubagentRunManager;
use crate::transform::EventTransformer;
use serde_json::json;
use std::sync::Arc;
use tether_gateway::GatewayClient;
use tether_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tether_types::{parse_raw_line, parse_raw_value, RawEvent, RawPayload, RunStatus};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use uuid::Uuid;

#[derive(Clone)]
pub struct ActiveRunManager {
    registry: Arc<RunRegistry>,
    persist: PersistenceWriter,
    supervisor: Arc<ProcessSupervisor>,
    gateway: GatewayClient,
    subagents: SubagentRunManager,
    config: EngineConfig,
}

impl ActiveRunManager {
    pub fn new(
        registry: Arc<RunRegistry>,
        persist: PersistenceWriter,
        gateway: GatewayClient,
        subagents: SubagentRunManager,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            persist,
            supervisor: Arc::new(ProcessSupervisor::new(config.kill_escalation())),
            gateway,
            subagents,
            config,
        }
    }

    /// Launch a parent run. Rejects when a live run already holds the
    /// identity; a terminal run still inside its grace period is evicted and
    /// replaced.
    pub async fn start(&self, identity: &str, spec: ProcessSpec) -> anyhow::Result<Arc<Run>> {
        if let Some(existing) = self.registry.get(identity) {
            if existing.status().is_live() {
                return Err(EngineError::RunExists(identity.to_string()).into());
            }
            existing.cancel_eviction();
            self.registry.evict(identity);
        }

        let run = Run::new(
            identity,
            None,
            Uuid::new_v4().to_string(),
            self.config.persist_debounce(),
        );
        self.registry.insert(run.clone());
        if let Err(err) = self
            .persist
            .store()
            .upsert_run(RunIndexEntry {
                identity: run.identity.clone(),
                run_id: run.run_id.clone(),
                message_id: run.message_id.clone(),
                parent: None,
                task: None,
                label: None,
                status: RunStatus::Running,
                started_at: run.started_at(),
                ended_at: None,
                last_seq: 0,
                records: 0,
            })
            .await
        {
            warn!("failed to index run {identity}: {err}");
        }

        let handle = match self.supervisor.launch(spec) {
            Ok(handle) => handle,
            Err(err) => {
                let mut transformer =
                    EventTransformer::new(run.clone(), self.persist.clone());
                transformer.report_error(format!("Failed to start agent process: {err}"));
                self.finalize(&run, RunStatus::Error, Some(err.to_string()))
                    .await;
                return Err(err);
            }
        };

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.started",
                component: "engine.active",
                identity: Some(identity),
                run_id: Some(&run.run_id),
                parent: None,
                status: Some("running"),
                error_code: None,
                detail: None,
            },
        );

        let manager = self.clone();
        let driver_run = run.clone();
        tokio::spawn(async move {
            manager.drive(driver_run, handle).await;
        });

        Ok(run)
    }

    /// Abort a live run: flip to `error` immediately (so a replacement start
    /// is not rejected), tear down the waiting-phase subscription, signal the
    /// process, and notify the broker redundantly.
    pub async fn abort(&self, identity: &str) -> bool {
        let Some(run) = self.registry.get(identity) else {
            return false;
        };
        if !run.set_terminal(RunStatus::Error) {
            return false;
        }
        run.take_gateway_guard();
        run.cancel.cancel();
        // Redundant fire-and-forget abort notification, independent of the
        // process's own teardown path.
        self.gateway.notify(json!({
            "op": "abort",
            "sessionKey": identity,
            "runId": run.run_id,
        }));
        self.persist.flush(&run).await;
        if let Err(err) = self
            .persist
            .store()
            .set_outcome(
                &run.run_id,
                RunOutcome {
                    exit_ok: false,
                    error: Some("aborted".to_string()),
                },
            )
            .await
        {
            warn!("failed to record abort outcome for {identity}: {err}");
        }
        run.drain_subscribers();
        run.schedule_eviction(self.config.parent_grace(), self.registry.clone());

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.aborted",
                component: "engine.active",
                identity: Some(identity),
                run_id: Some(&run.run_id),
                parent: None,
                status: Some("error"),
                error_code: None,
                detail: None,
            },
        );
        true
    }

    pub fn has_active(&self, identity: &str) -> bool {
        self.registry.has_running(identity)
    }

    pub fn running_identities(&self) -> Vec<String> {
        self.registry.running_identities()
    }

    /// Event-handling loop for one run: the only mutator of its state while
    /// the process is alive, and again during the waiting phase.
    async fn drive(&self, run: Arc<Run>, mut handle: ProcessHandle) {
        let mut transformer = EventTransformer::new(run.clone(), self.persist.clone());
        let mut cancel_forwarded = false;
        let mut waiting_events = None;

        loop {
            tokio::select! {
                event = handle.events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        ProcessEvent::Stdout(line) => {
                            let Some(raw) = parse_raw_line(&line) else { continue };
                            self.route_raw(&run, &mut transformer, raw);
                        }
                        ProcessEvent::Exited { code } => {
                            run.set_exit_code(code);
                            waiting_events = self
                                .on_process_exit(&run, &mut transformer, code, &handle.stderr_tail())
                                .await;
                            break;
                        }
                    }
                }
                _ = run.cancel.cancelled(), if !cancel_forwarded => {
                    cancel_forwarded = true;
                    handle.cancel();
                }
            }
        }

        if let Some(events) = waiting_events {
            self.waiting_loop(&run, &mut transformer, events).await;
        }
    }

    /// Dispatch one raw record from the parent's output stream. Records
    /// tagged for a dependent identity ride along to the subagent manager.
    fn route_raw(&self, run: &Arc<Run>, transformer: &mut EventTransformer, raw: RawEvent) {
        if let Some(key) = raw.session_key.as_deref() {
            if key != run.identity {
                self.subagents.route(raw);
                return;
            }
        }
        if !run.accept_seq(raw.seq) {
            return;
        }
        transformer.handle(&raw);
    }

    /// Process exit: either hand off to the waiting phase (dependents still
    /// live) or finalize by exit cleanliness.
    async fn on_process_exit(
        &self,
        run: &Arc<Run>,
        transformer: &mut EventTransformer,
        code: Option<i32>,
        stderr_tail: &str,
    ) -> Option<mpsc::UnboundedReceiver<serde_json::Value>> {
        if run.status().is_terminal() {
            return None;
        }
        if self.subagents.has_live_children(&run.identity) {
            run.set_status(RunStatus::WaitingForDependents);
            transformer.open_waiting_segment();
            self.persist.flush(run).await;
            info!(
                "run {} waiting for dependents after process exit",
                run.identity
            );

            // Subscribe-only attachment for announcement-driven continuation
            // turns; the sequence dedupe absorbs any overlap with events the
            // process already delivered.
            let (tx, rx) = mpsc::unbounded_channel();
            let guard = self.gateway.subscribe(&run.identity, tx);
            run.set_gateway_guard(guard);
            Some(rx)
        } else {
            self.finalize_by_exit(run, transformer, code, stderr_tail)
                .await;
            None
        }
    }

    /// Consume continuation turns from the broker until a lifecycle end
    /// arrives with no dependents left.
    async fn waiting_loop(
        &self,
        run: &Arc<Run>,
        transformer: &mut EventTransformer,
        mut events: mpsc::UnboundedReceiver<serde_json::Value>,
    ) {
        while let Some(value) = events.recv().await {
            if run.status().is_terminal() {
                break;
            }
            let Some(raw) = parse_raw_value(value) else {
                continue;
            };
            if !run.accept_seq(raw.seq) {
                continue;
            }
            let turn_ended = matches!(raw.payload, RawPayload::LifecycleEnd);
            transformer.handle(&raw);
            if turn_ended {
                if self.subagents.has_live_children(&run.identity) {
                    // dependents still running: stay in the waiting phase
                    transformer.open_waiting_segment();
                    self.persist.flush(run).await;
                } else {
                    self.finalize_by_exit(run, transformer, run.exit_code(), "")
                        .await;
                    break;
                }
            }
        }
    }

    async fn finalize_by_exit(
        &self,
        run: &Arc<Run>,
        transformer: &mut EventTransformer,
        code: Option<i32>,
        stderr_tail: &str,
    ) {
        transformer.finish_process_exit(code, stderr_tail);
        let (status, error) = if code == Some(0) {
            (RunStatus::Completed, None)
        } else {
            (
                RunStatus::Error,
                Some(match code {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                }),
            )
        };
        self.finalize(run, status, error).await;
    }

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
        run.schedule_eviction(self.config.parent_grace(), self.registry.clone());

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.finalized",
                component: "engine.active",
                identity: Some(&run.identity),
                run_id: Some(&run.run_id),
                parent: None,
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

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::RunStore;
    use crate::subagent::SubagentSpec;
    use crate::subscribers::SubscriberHub;
    use serde_json::json;
    use std::time::Duration;
    use tether_gateway::GatewayConfig;
    use tether_types::WireEvent;

    struct Harness {
        _dir: tempfile::TempDir,
        registry: Arc<RunRegistry>,
        store: Arc<RunStore>,
        manager: ActiveRunManager,
        subagents: SubagentRunManager,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::new(dir.path()).await.unwrap());
        let persist = PersistenceWriter::new(store.clone());
        let registry = RunRegistry::new();
        let gateway = GatewayClient::new(GatewayConfig::default());
        let mut config = EngineConfig::default();
        config.persist_debounce_ms = 20;
        config.parent_grace_ms = 200;
        config.subagent_grace_ms = 200;
        let subagents = SubagentRunManager::new(
            registry.clone(),
            persist.clone(),
            gateway.clone(),
            config.clone(),
        );
        let manager = ActiveRunManager::new(
            registry.clone(),
            persist,
            gateway,
            subagents.clone(),
            config,
        );
        Harness {
            _dir: dir,
            registry,
            store,
            manager,
            subagents,
        }
    }

    fn emitting_spec(lines: &[&str], exit: i32) -> ProcessSpec {
        let mut script = String::new();
        for line in lines {
            script.push_str(&format!("printf '%s\\n' '{line}'\n"));
        }
        script.push_str(&format!("exit {exit}"));
        ProcessSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script],
            ..ProcessSpec::default()
        }
    }

    fn sleeping_spec() -> ProcessSpec {
        ProcessSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            ..ProcessSpec::default()
        }
    }

    async fn wait_for_status(run: &Arc<Run>, status: RunStatus) {
        for _ in 0..100 {
            if run.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "run {} never reached {status}, stuck at {}",
            run.identity,
            run.status()
        );
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
    async fn run_streams_events_and_completes() {
        let h = harness().await;
        let run = h
            .manager
            .start(
                "s1",
                emitting_spec(
                    &[
                        r#"{"event":"agent","stream":"thinking","data":{"text":"checking"}}"#,
                        r#"{"event":"agent","stream":"assistant","data":{"text":"all good"}}"#,
                        r#"{"event":"agent","stream":"lifecycle","data":{"phase":"end"}}"#,
                    ],
                    0,
                ),
            )
            .await
            .unwrap();

        let hub = SubscriberHub::new(h.registry.clone());
        let mut sub = hub.subscribe("s1", true).unwrap();
        let mut kinds = Vec::new();
        while let Some(event) = sub.next().await {
            kinds.push(event.kind());
        }

        assert_eq!(run.status(), RunStatus::Completed);
        assert!(kinds.contains(&"text-delta"));
        assert_eq!(kinds.last(), Some(&"text-end"));
        assert_eq!(run.snapshot_message().content, "all good");

        let outcome = h.store.outcome(&run.run_id).await.unwrap();
        assert!(outcome.exit_ok);
        let messages = h.store.messages("s1").await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].streaming, None);
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected_while_live() {
        let h = harness().await;
        let _run = h.manager.start("s1", sleeping_spec()).await.unwrap();
        let second = h.manager.start("s1", sleeping_spec()).await;
        assert!(second.is_err());
        assert!(second
            .unwrap_err()
            .downcast_ref::<EngineError>()
            .is_some());
        assert!(h.manager.abort("s1").await);
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_unblocks_restart() {
        let h = harness().await;
        let run = h.manager.start("s1", sleeping_spec()).await.unwrap();
        assert!(h.manager.has_active("s1"));

        assert!(h.manager.abort("s1").await);
        assert!(!h.manager.abort("s1").await);
        assert_eq!(run.status(), RunStatus::Error);
        assert!(!h.manager.has_active("s1"));

        // terminal entry within grace period is evicted and replaced
        let replacement = h.manager.start("s1", sleeping_spec()).await.unwrap();
        assert!(h.manager.has_active("s1"));
        assert!(h.manager.abort("s1").await);
        assert_eq!(replacement.status(), RunStatus::Error);
    }

    #[tokio::test]
    async fn abort_of_unknown_identity_returns_false() {
        let h = harness().await;
        assert!(!h.manager.abort("ghost").await);
    }

    #[tokio::test]
    async fn dirty_exit_without_output_synthesizes_error_record() {
        let h = harness().await;
        let run = h.manager.start("s1", emitting_spec(&[], 1)).await.unwrap();
        wait_for_status(&run, RunStatus::Error).await;

        let content = run.snapshot_message().content;
        assert!(content.contains("exit code 1"), "got: {content}");
        let outcome = wait_for_outcome(&h.store, &run.run_id).await;
        assert!(!outcome.exit_ok);
    }

    #[tokio::test]
    async fn finished_run_is_evicted_after_grace_period() {
        let h = harness().await;
        let run = h.manager.start("s1", emitting_spec(&[], 0)).await.unwrap();
        wait_for_status(&run, RunStatus::Completed).await;
        assert!(h.registry.get("s1").is_some());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(h.registry.get("s1").is_none());
    }

    #[tokio::test]
    async fn parent_enters_waiting_phase_while_dependents_live() {
        let h = harness().await;
        h.subagents
            .register(SubagentSpec {
                identity: "s1:child".to_string(),
                run_id: "child-run".to_string(),
                parent: "s1".to_string(),
                task: Some("analyze".to_string()),
                label: None,
            })
            .await
            .unwrap();

        let run = h.manager.start("s1", emitting_spec(&[], 0)).await.unwrap();
        wait_for_status(&run, RunStatus::WaitingForDependents).await;

        let mut messages = h.store.messages("s1").await;
        for _ in 0..100 {
            if !messages.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            messages = h.store.messages("s1").await;
        }
        assert_eq!(messages[0].streaming, Some(true));
        assert!(messages[0].parts.iter().any(|part| matches!(
            part,
            tether_types::MessagePart::Reasoning { text } if text.starts_with("Waiting for")
        )));
        assert!(h.manager.abort("s1").await);
    }

    #[tokio::test]
    async fn waiting_run_completes_after_dependents_and_final_turn() {
        let h = harness().await;
        h.subagents
            .register(SubagentSpec {
                identity: "s1:child".to_string(),
                run_id: "child-run".to_string(),
                parent: "s1".to_string(),
                task: None,
                label: None,
            })
            .await
            .unwrap();

        let run = h.manager.start("s1", emitting_spec(&[], 0)).await.unwrap();
        wait_for_status(&run, RunStatus::WaitingForDependents).await;

        // Drive the waiting loop directly, standing in for the broker feed.
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = h.manager.clone();
        let waiting_run = run.clone();
        let waiting = tokio::spawn(async move {
            let mut transformer =
                EventTransformer::new(waiting_run.clone(), manager.persist.clone());
            manager.waiting_loop(&waiting_run, &mut transformer, rx).await;
        });

        // A continuation turn ends while the child is still live: stay waiting.
        tx.send(json!({
            "event": "agent", "stream": "lifecycle", "sessionKey": "s1",
            "globalSeq": 10, "data": {"phase": "end"}
        }))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(run.status(), RunStatus::WaitingForDependents);

        // Child finishes.
        h.subagents.route(
            tether_types::parse_raw_value(json!({
                "event": "agent", "stream": "lifecycle", "sessionKey": "s1:child",
                "globalSeq": 11, "data": {"phase": "end"}
            }))
            .unwrap(),
        );
        for _ in 0..100 {
            if !h.subagents.has_live_children("s1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The next continuation turn end finalizes the parent.
        tx.send(json!({
            "event": "agent", "stream": "lifecycle", "sessionKey": "s1",
            "globalSeq": 12, "data": {"phase": "end"}
        }))
        .unwrap();
        wait_for_status(&run, RunStatus::Completed).await;
        waiting.await.unwrap();

        let messages = h.store.messages("s1").await;
        assert_eq!(messages[0].streaming, None);

        // duplicate of an already-seen sequence number is dropped
        assert!(!run.accept_seq(Some(12)));
    }

    #[tokio::test]
    async fn launch_failure_finalizes_as_error() {
        let h = harness().await;
        let spec = ProcessSpec {
            program: "/definitely/not/real".to_string(),
            ..ProcessSpec::default()
        };
        assert!(h.manager.start("s1", spec).await.is_err());
        let run = h.registry.get("s1").unwrap();
        assert_eq!(run.status(), RunStatus::Error);
        let content = run.snapshot_message().content;
        assert!(content.contains("Failed to start agent process"));
    }

    #[tokio::test]
    async fn subscriber_sees_live_then_end_after_abort() {
        let h = harness().await;
        let _run = h.manager.start("s1", sleeping_spec()).await.unwrap();
        let hub = SubscriberHub::new(h.registry.clone());
        let mut sub = hub.subscribe("s1", true).unwrap();

        assert!(h.manager.abort("s1").await);
        // channel closes exactly once after the drain
        let mut remaining: Vec<WireEvent> = Vec::new();
        while let Some(event) = sub.next().await {
            remaining.push(event);
        }
        assert!(hub.subscribe("ghost", true).is_none());
    }
}
