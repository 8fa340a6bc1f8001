//! Event transformation: raw agent records in, wire events out.
//!
//! Maintains the open/close state for streaming text and reasoning segments
//! and appends to the run's accumulated message in the same step, so the
//! persisted record always matches what replaying the buffer would
//! reconstruct. Synthetic "status" reasoning segments narrate internal
//! phases (preparing, compaction, waiting); they close automatically before
//! any real output begins.

use crate::persist::PersistenceWriter;
use crate::run::Run;
use std::sync::Arc;
use tether_types::{
    is_silent_reply_fragment, MessagePart, RawEvent, RawPayload, WireEvent,
};
use tracing::debug;
use uuid::Uuid;

const PREPARING_NOTE: &str = "Preparing response...";
const COMPACTION_NOTE: &str = "Optimizing context...";
const COMPACTION_RETRY_NOTE: &str = "Retrying...";
const WAITING_NOTE: &str = "Waiting for background tasks to finish...";
const NO_RESPONSE_NOTE: &str = "No response from the agent.";
const DIAGNOSTIC_LIMIT: usize = 300;

enum OpenText {
    /// Content so far is the silent-reply token or a prefix of it; nothing
    /// has been emitted and no part exists yet.
    Held { id: String, buffered: String },
    Live { id: String, part_index: usize },
}

struct OpenReasoning {
    id: String,
    part_index: usize,
    synthetic: bool,
}

pub struct EventTransformer {
    run: Arc<Run>,
    persist: PersistenceWriter,
    open_text: Option<OpenText>,
    open_reasoning: Option<OpenReasoning>,
    error_reported: bool,
    text_emitted: bool,
}

impl EventTransformer {
    pub fn new(run: Arc<Run>, persist: PersistenceWriter) -> Self {
        Self {
            run,
            persist,
            open_text: None,
            open_reasoning: None,
            error_reported: false,
            text_emitted: false,
        }
    }

    /// Process one raw upstream record. Sequence-number dedupe happens
    /// before this point; everything arriving here is applied.
    pub fn handle(&mut self, raw: &RawEvent) {
        match &raw.payload {
            RawPayload::LifecycleStart => self.open_status(PREPARING_NOTE),
            RawPayload::LifecycleEnd => self.close_segments(),
            RawPayload::LifecycleError { message } => self.report_error(message.clone()),
            RawPayload::Thinking { delta } => self.append_reasoning(delta),
            RawPayload::Assistant {
                delta,
                media,
                error,
            } => {
                if let Some(delta) = delta {
                    self.append_text(delta);
                }
                for url in media {
                    self.append_text(&format!("\n[media {url}]"));
                }
                if let Some(message) = error {
                    self.report_error(message.clone());
                }
            }
            RawPayload::ToolStart {
                call_id,
                name,
                args,
            } => self.tool_start(call_id, name, args.clone()),
            RawPayload::ToolResult {
                call_id,
                output,
                error,
            } => self.tool_result(call_id, output.clone(), error.clone()),
            RawPayload::CompactionStart => self.open_status(COMPACTION_NOTE),
            RawPayload::CompactionEnd { will_retry } => self.compaction_end(*will_retry),
        }
        self.persist.schedule(&self.run);
    }

    /// Close whatever is open. Terminal for one processing pass; the run
    /// itself may continue into a waiting phase.
    pub fn close_segments(&mut self) {
        self.close_reasoning();
        self.close_text();
    }

    /// Narrate the waiting-for-dependents phase.
    pub fn open_waiting_segment(&mut self) {
        self.open_status(WAITING_NOTE);
    }

    pub fn error_reported(&self) -> bool {
        self.error_reported
    }

    /// Wrap up after the agent process exited. Synthesizes the informational
    /// or error segment when the run would otherwise end silently.
    pub fn finish_process_exit(&mut self, code: Option<i32>, stderr_tail: &str) {
        self.close_segments();
        if code == Some(0) {
            if !self.text_emitted {
                self.append_text(NO_RESPONSE_NOTE);
                self.close_text();
            }
            return;
        }
        if !self.error_reported {
            let message = extract_error_from_diagnostics(stderr_tail).unwrap_or_else(|| {
                match code {
                    Some(code) => format!("Agent process exited with code {code}."),
                    None => "Agent process was terminated before completing.".to_string(),
                }
            });
            self.report_error(message);
        }
    }

    /// Convert a failure into a self-contained error text segment. At most
    /// one error is reported per run, wherever it comes from.
    pub fn report_error(&mut self, message: String) {
        if self.error_reported {
            return;
        }
        self.error_reported = true;
        self.close_segments();

        let id = Uuid::new_v4().to_string();
        let part_index = self.run.append_part(
            WireEvent::TextStart { id: id.clone() },
            MessagePart::Text {
                text: String::new(),
            },
        );
        let delta = message.clone();
        self.run.record(
            WireEvent::TextDelta {
                id: id.clone(),
                delta: message,
            },
            move |parts| {
                if let Some(MessagePart::Text { text }) = parts.get_mut(part_index) {
                    text.push_str(&delta);
                }
            },
        );
        self.run.record(WireEvent::TextEnd { id }, |_| {});
        self.text_emitted = true;
    }

    fn append_reasoning(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.close_text();
        if self
            .open_reasoning
            .as_ref()
            .is_some_and(|open| open.synthetic)
        {
            // real reasoning displaces the status narration
            self.close_reasoning();
        }
        if self.open_reasoning.is_none() {
            let id = Uuid::new_v4().to_string();
            let part_index = self.run.append_part(
                WireEvent::ReasoningStart { id: id.clone() },
                MessagePart::Reasoning {
                    text: String::new(),
                },
            );
            self.open_reasoning = Some(OpenReasoning {
                id,
                part_index,
                synthetic: false,
            });
        }
        if let Some(open) = &self.open_reasoning {
            push_reasoning_delta(&self.run, &open.id, open.part_index, delta);
        }
    }

    fn open_status(&mut self, note: &str) {
        self.close_text();
        if let Some(open) = &self.open_reasoning {
            if open.synthetic {
                // successive phases share one status segment
                push_reasoning_delta(&self.run, &open.id, open.part_index, &format!("\n{note}"));
                return;
            }
        }
        self.close_reasoning();
        let id = Uuid::new_v4().to_string();
        let part_index = self.run.append_part(
            WireEvent::ReasoningStart { id: id.clone() },
            MessagePart::Reasoning {
                text: String::new(),
            },
        );
        push_reasoning_delta(&self.run, &id, part_index, note);
        self.open_reasoning = Some(OpenReasoning {
            id,
            part_index,
            synthetic: true,
        });
    }

    fn compaction_end(&mut self, will_retry: bool) {
        let Some(open) = &self.open_reasoning else {
            return;
        };
        if !open.synthetic {
            return;
        }
        if will_retry {
            push_reasoning_delta(
                &self.run,
                &open.id,
                open.part_index,
                &format!("\n{COMPACTION_RETRY_NOTE}"),
            );
        } else {
            self.close_reasoning();
        }
    }

    fn append_text(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.close_reasoning();
        match self.open_text.take() {
            None => {
                let id = Uuid::new_v4().to_string();
                self.open_text = self.settle_text(id, delta.to_string());
            }
            Some(OpenText::Held { id, mut buffered }) => {
                buffered.push_str(delta);
                self.open_text = self.settle_text(id, buffered);
            }
            Some(OpenText::Live { id, part_index }) => {
                let owned = delta.to_string();
                self.run.record(
                    WireEvent::TextDelta {
                        id: id.clone(),
                        delta: delta.to_string(),
                    },
                    move |parts| {
                        if let Some(MessagePart::Text { text }) = parts.get_mut(part_index) {
                            text.push_str(&owned);
                        }
                    },
                );
                self.open_text = Some(OpenText::Live { id, part_index });
            }
        }
    }

    /// Decide whether accumulated text can be released. While the content is
    /// still a prefix of the silent-reply token it stays held: nothing is
    /// emitted and no part exists, so a segment that never diverges simply
    /// vanishes at close.
    fn settle_text(&mut self, id: String, buffered: String) -> Option<OpenText> {
        if is_silent_reply_fragment(&buffered) {
            return Some(OpenText::Held { id, buffered });
        }
        let part_index = self.run.append_part(
            WireEvent::TextStart { id: id.clone() },
            MessagePart::Text {
                text: String::new(),
            },
        );
        let owned = buffered.clone();
        self.run.record(
            WireEvent::TextDelta {
                id: id.clone(),
                delta: buffered,
            },
            move |parts| {
                if let Some(MessagePart::Text { text }) = parts.get_mut(part_index) {
                    text.push_str(&owned);
                }
            },
        );
        self.text_emitted = true;
        Some(OpenText::Live { id, part_index })
    }

    fn tool_start(&mut self, call_id: &str, name: &str, args: serde_json::Value) {
        self.close_segments();
        self.run.append_part(
            WireEvent::ToolInputStart {
                tool_call_id: call_id.to_string(),
                tool_name: name.to_string(),
            },
            MessagePart::ToolInvocation {
                call_id: call_id.to_string(),
                name: name.to_string(),
                args: args.clone(),
                result: None,
                error_text: None,
            },
        );
        self.run.record(
            WireEvent::ToolInputAvailable {
                tool_call_id: call_id.to_string(),
                tool_name: name.to_string(),
                input: args,
            },
            |_| {},
        );
    }

    fn tool_result(
        &mut self,
        call_id: &str,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        if !self.run.has_tool_invocation(call_id) {
            debug!("dropping tool result for unknown call id {call_id}");
            return;
        }
        let call = call_id.to_string();
        match error {
            Some(message) => {
                let attach = message.clone();
                self.run.record(
                    WireEvent::ToolOutputError {
                        tool_call_id: call.clone(),
                        error_text: message,
                    },
                    move |parts| attach_tool_outcome(parts, &call, None, Some(attach)),
                );
            }
            None => {
                let output = output.unwrap_or(serde_json::Value::Null);
                let attach = output.clone();
                self.run.record(
                    WireEvent::ToolOutputAvailable {
                        tool_call_id: call.clone(),
                        output,
                    },
                    move |parts| attach_tool_outcome(parts, &call, Some(attach), None),
                );
            }
        }
    }

    fn close_text(&mut self) {
        match self.open_text.take() {
            Some(OpenText::Live { id, .. }) => {
                self.run.record(WireEvent::TextEnd { id }, |_| {});
            }
            // A held segment was entirely the silent reply (or a prefix of
            // it): it is dropped without a trace.
            Some(OpenText::Held { .. }) | None => {}
        }
    }

    fn close_reasoning(&mut self) {
        if let Some(open) = self.open_reasoning.take() {
            self.run
                .record(WireEvent::ReasoningEnd { id: open.id }, |_| {});
        }
    }
}

fn push_reasoning_delta(run: &Arc<Run>, id: &str, part_index: usize, delta: &str) {
    let owned = delta.to_string();
    run.record(
        WireEvent::ReasoningDelta {
            id: id.to_string(),
            delta: delta.to_string(),
        },
        move |parts| {
            if let Some(MessagePart::Reasoning { text }) = parts.get_mut(part_index) {
                text.push_str(&owned);
            }
        },
    );
}

fn attach_tool_outcome(
    parts: &mut [MessagePart],
    call: &str,
    result: Option<serde_json::Value>,
    error: Option<String>,
) {
    for part in parts.iter_mut() {
        if let MessagePart::ToolInvocation {
            call_id,
            result: slot,
            error_text,
            ..
        } = part
        {
            if call_id == call {
                *slot = result;
                *error_text = error;
                return;
            }
        }
    }
}

/// Last-resort error extraction from captured stderr: the most recent line
/// that looks like a diagnostic.
fn extract_error_from_diagnostics(stderr: &str) -> Option<String> {
    let line = stderr.lines().rev().map(str::trim).find(|line| {
        if line.is_empty() {
            return false;
        }
        let lower = line.to_lowercase();
        lower.contains("error") || lower.contains("panic") || lower.contains("fatal")
    })?;
    let mut message = line.to_string();
    if message.len() > DIAGNOSTIC_LIMIT {
        message.truncate(DIAGNOSTIC_LIMIT);
        message.push_str("...");
    }
    Some(message)
}
