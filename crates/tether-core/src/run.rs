//! Per-run state: the append-only event buffer, live subscribers, the
//! accumulated message, and the dedupe/cancellation bookkeeping.
//!
//! All mutation goes through the short critical sections in this module. The
//! driving task for a run is the only writer during streaming; subscribers
//! and status readers only take the lock briefly.

use crate::delay::{Debounce, DelayedAction};
use crate::registry::RunRegistry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tether_gateway::SubscriptionGuard;
use tether_types::{MessagePart, RunStatus, StoredMessage, WireEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Subscriber {
    tx: mpsc::UnboundedSender<WireEvent>,
}

struct RunState {
    status: RunStatus,
    buffer: Vec<WireEvent>,
    subscribers: Vec<Subscriber>,
    parts: Vec<MessagePart>,
    last_seen_seq: u64,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    /// Watermark into `buffer`: everything before it is already in the
    /// on-disk event log.
    events_logged: usize,
}

/// One tracked run, parent or dependent.
pub struct Run {
    pub identity: String,
    pub run_id: String,
    pub message_id: String,
    pub parent: Option<String>,
    /// Cancellation handle for the underlying process or subscription.
    pub cancel: CancellationToken,
    pub flush_debounce: Debounce,
    state: Mutex<RunState>,
    eviction: Mutex<Option<DelayedAction>>,
    gateway_sub: Mutex<Option<SubscriptionGuard>>,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("identity", &self.identity)
            .field("run_id", &self.run_id)
            .field("message_id", &self.message_id)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

/// Live view of a run's event stream. Items arrive in buffer order; the
/// channel closing is the end-of-stream signal and is delivered exactly once.
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<WireEvent>,
}

impl EventSubscription {
    pub async fn next(&mut self) -> Option<WireEvent> {
        self.rx.recv().await
    }

    /// Non-blocking drain of whatever is already queued.
    pub fn drain_ready(&mut self) -> Vec<WireEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }
}

impl Run {
    pub fn new(
        identity: impl Into<String>,
        parent: Option<String>,
        run_id: impl Into<String>,
        debounce: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.into(),
            run_id: run_id.into(),
            message_id: Uuid::new_v4().to_string(),
            parent,
            cancel: CancellationToken::new(),
            flush_debounce: Debounce::new(debounce),
            state: Mutex::new(RunState {
                status: RunStatus::Running,
                buffer: Vec::new(),
                subscribers: Vec::new(),
                parts: Vec::new(),
                last_seen_seq: 0,
                started_at: Utc::now(),
                ended_at: None,
                exit_code: None,
                events_logged: 0,
            }),
            eviction: Mutex::new(None),
            gateway_sub: Mutex::new(None),
        })
    }

    /// Reconstruct a run from its persisted index entry, event log, and
    /// message snapshot after a host restart.
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrated(
        identity: impl Into<String>,
        parent: Option<String>,
        run_id: impl Into<String>,
        message_id: impl Into<String>,
        status: RunStatus,
        buffer: Vec<WireEvent>,
        parts: Vec<MessagePart>,
        last_seen_seq: u64,
        debounce: Duration,
    ) -> Arc<Self> {
        let events_logged = buffer.len();
        Arc::new(Self {
            identity: identity.into(),
            run_id: run_id.into(),
            message_id: message_id.into(),
            parent,
            cancel: CancellationToken::new(),
            flush_debounce: Debounce::new(debounce),
            state: Mutex::new(RunState {
                status,
                buffer,
                subscribers: Vec::new(),
                parts,
                last_seen_seq,
                started_at: Utc::now(),
                ended_at: None,
                exit_code: None,
                events_logged,
            }),
            eviction: Mutex::new(None),
            gateway_sub: Mutex::new(None),
        })
    }

    pub fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    /// Transition within the live states (running -> waiting-for-dependents).
    /// Ignored once terminal.
    pub fn set_status(&self, status: RunStatus) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        state.status = status;
    }

    /// One-shot transition into a terminal status. Returns false if the run
    /// was already terminal (the loser of an abort/exit race does nothing).
    pub fn set_terminal(&self, status: RunStatus) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        state.ended_at = Some(Utc::now());
        true
    }

    /// Drop every live subscriber, closing their channels. Closing the
    /// channel is the end-of-stream signal, so this is the single point
    /// where observers learn the run is over.
    pub fn drain_subscribers(&self) {
        self.state.lock().subscribers.clear();
    }

    pub fn set_exit_code(&self, code: Option<i32>) {
        self.state.lock().exit_code = code;
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().exit_code
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.state.lock().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().ended_at
    }

    /// Sequence-number dedupe against the upstream source. Events without a
    /// sequence number are always accepted; numbered events must strictly
    /// advance.
    pub fn accept_seq(&self, seq: Option<u64>) -> bool {
        let Some(seq) = seq else { return true };
        let mut state = self.state.lock();
        if seq <= state.last_seen_seq {
            return false;
        }
        state.last_seen_seq = seq;
        true
    }

    pub fn last_seen_seq(&self) -> u64 {
        self.state.lock().last_seen_seq
    }

    /// Append a wire event and apply the matching accumulated-message update
    /// in the same critical section, then fan out to live subscribers.
    /// Ignored once terminal: the buffer is immutable after finalization.
    pub fn record<F>(&self, event: WireEvent, update: F)
    where
        F: FnOnce(&mut Vec<MessagePart>),
    {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        state.buffer.push(event.clone());
        update(&mut state.parts);
        state
            .subscribers
            .retain(|sub| sub.tx.send(event.clone()).is_ok());
    }

    /// Append a wire event together with a new message part. Returns the
    /// part's index, which stays valid because parts are append-only.
    pub fn append_part(&self, event: WireEvent, part: MessagePart) -> usize {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return state.parts.len().saturating_sub(1);
        }
        state.buffer.push(event.clone());
        state.parts.push(part);
        let index = state.parts.len() - 1;
        state
            .subscribers
            .retain(|sub| sub.tx.send(event.clone()).is_ok());
        index
    }

    /// Attach an observer. With `replay`, the entire buffer is delivered
    /// before the method returns and before any live event can be enqueued:
    /// both happen under the same lock, so the replayed prefix is exactly
    /// what a continuously attached observer would have seen.
    pub fn subscribe(&self, replay: bool) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if replay {
            for event in &state.buffer {
                let _ = tx.send(event.clone());
            }
        }
        if !state.status.is_terminal() {
            state.subscribers.push(Subscriber { tx });
        }
        // For a terminal run the sender drops here, closing the channel right
        // after the replayed prefix: replay, then the end signal.
        EventSubscription { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Snapshot of the accumulated message for persistence. Silent-reply
    /// text parts are filtered even if one leaked into the buffer; the
    /// streaming marker is present only while the run is live.
    pub fn snapshot_message(&self) -> StoredMessage {
        let state = self.state.lock();
        let parts: Vec<MessagePart> = state
            .parts
            .iter()
            .filter(|part| !part.is_silent_reply())
            .cloned()
            .collect();
        let content: String = parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        StoredMessage {
            id: self.message_id.clone(),
            role: "assistant".to_string(),
            content,
            parts,
            timestamp: state.started_at,
            streaming: state.status.is_live().then_some(true),
        }
    }

    /// Buffer suffix not yet written to the on-disk event log; advances the
    /// watermark.
    pub fn take_unlogged_events(&self) -> Vec<WireEvent> {
        let mut state = self.state.lock();
        let fresh = state.buffer[state.events_logged..].to_vec();
        state.events_logged = state.buffer.len();
        fresh
    }

    /// Whether a tool invocation part exists for `call_id`; tool results for
    /// unknown calls are unroutable.
    pub fn has_tool_invocation(&self, call_id: &str) -> bool {
        self.state.lock().parts.iter().any(|part| {
            matches!(part, MessagePart::ToolInvocation { call_id: id, .. } if id == call_id)
        })
    }

    pub fn buffer_snapshot(&self) -> Vec<WireEvent> {
        self.state.lock().buffer.clone()
    }

    pub fn parts_snapshot(&self) -> Vec<MessagePart> {
        self.state.lock().parts.clone()
    }

    pub fn schedule_eviction(self: &Arc<Self>, grace: Duration, registry: Arc<RunRegistry>) {
        let identity = self.identity.clone();
        let action = DelayedAction::spawn(grace, async move {
            registry.evict(&identity);
        });
        let mut slot = self.eviction.lock();
        if let Some(previous) = slot.replace(action) {
            previous.cancel();
        }
    }

    pub fn cancel_eviction(&self) {
        if let Some(action) = self.eviction.lock().take() {
            action.cancel();
        }
    }

    pub fn set_gateway_guard(&self, guard: SubscriptionGuard) {
        *self.gateway_sub.lock() = Some(guard);
    }

    /// Drop the gateway subscription, if any. Dropping the guard is the
    /// unsubscribe.
    pub fn take_gateway_guard(&self) {
        self.gateway_sub.lock().take();
    }
}
