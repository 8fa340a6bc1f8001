use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reply token an agent emits when it intentionally has nothing to say.
/// It must never surface in the wire stream or the persisted record; partial
/// deliveries (any strict prefix) are suppressed the same way.
pub const SILENT_REPLY: &str = "NO_REPLY";

/// True when `text` is the silent-reply token or a non-empty strict prefix of
/// it, i.e. content that could still turn out to be a partially delivered
/// sentinel and must be withheld.
pub fn is_silent_reply_fragment(text: &str) -> bool {
    !text.is_empty() && SILENT_REPLY.starts_with(text)
}

/// One structural piece of a run's accumulated output. Part order reflects
/// the interleaving of reasoning, text, and tool activity exactly as produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Reasoning {
        text: String,
    },
    Text {
        text: String,
    },
    ToolInvocation {
        #[serde(rename = "callId")]
        call_id: String,
        name: String,
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(
            rename = "errorText",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        error_text: Option<String>,
    },
}

impl MessagePart {
    pub fn is_silent_reply(&self) -> bool {
        matches!(self, MessagePart::Text { text } if is_silent_reply_fragment(text))
    }
}

/// Durable snapshot of a run's accumulated message, upserted by `id`.
/// `streaming` is present only while the run is still live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub parts: Vec<MessagePart>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
}

/// Lifecycle status of a run. Transitions are monotonic apart from the
/// abort shortcut straight to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Running,
    WaitingForDependents,
    Completed,
    Error,
}

impl RunStatus {
    pub fn is_live(self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::WaitingForDependents)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunStatus::Running => "running",
            RunStatus::WaitingForDependents => "waiting-for-dependents",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        };
        f.write_str(label)
    }
}
