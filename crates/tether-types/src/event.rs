use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized wire event delivered to subscribers and appended to run logs.
///
/// The tag and field names are part of the persisted format; clients replaying
/// an event log must see exactly what a live subscriber saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireEvent {
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ToolInputStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
    },
    ToolInputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
    },
    ToolOutputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        output: Value,
    },
    ToolOutputError {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "errorText")]
        error_text: String,
    },
}

impl WireEvent {
    /// Stable tag string, as serialized into the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            WireEvent::ReasoningStart { .. } => "reasoning-start",
            WireEvent::ReasoningDelta { .. } => "reasoning-delta",
            WireEvent::ReasoningEnd { .. } => "reasoning-end",
            WireEvent::TextStart { .. } => "text-start",
            WireEvent::TextDelta { .. } => "text-delta",
            WireEvent::TextEnd { .. } => "text-end",
            WireEvent::ToolInputStart { .. } => "tool-input-start",
            WireEvent::ToolInputAvailable { .. } => "tool-input-available",
            WireEvent::ToolOutputAvailable { .. } => "tool-output-available",
            WireEvent::ToolOutputError { .. } => "tool-output-error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_kebab_case_tags() {
        let event = WireEvent::ReasoningStart {
            id: "r1".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "reasoning-start", "id": "r1"}));
    }

    #[test]
    fn tool_events_use_camel_case_fields() {
        let event = WireEvent::ToolOutputError {
            tool_call_id: "c1".to_string(),
            error_text: "boom".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "tool-output-error", "toolCallId": "c1", "errorText": "boom"})
        );
    }

    #[test]
    fn round_trips_through_json() {
        let event = WireEvent::ToolInputAvailable {
            tool_call_id: "c2".to_string(),
            tool_name: "read".to_string(),
            input: json!({"path": "a.txt"}),
        };
        let text = serde_json::to_string(&event).unwrap();
        let parsed: WireEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn kind_matches_serialized_tag() {
        let event = WireEvent::TextDelta {
            id: "t1".to_string(),
            delta: "hi".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"].as_str(), Some(event.kind()));
    }
}
