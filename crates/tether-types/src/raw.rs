//! Parsing of raw upstream event records.
//!
//! The agent process (and the broker, during fallback delivery) emits loosely
//! typed JSON records: `{event, runId?, stream?, data?, sessionKey?,
//! globalSeq?}`. They are parsed into a small tagged union keyed by
//! `(event, stream, phase)`; unrecognized combinations and malformed lines
//! are skipped rather than guessed at.

use serde_json::Value;

/// Decoded payload of one raw upstream record.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    LifecycleStart,
    LifecycleEnd,
    LifecycleError { message: String },
    Thinking { delta: String },
    Assistant {
        delta: Option<String>,
        media: Vec<String>,
        error: Option<String>,
    },
    ToolStart {
        call_id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        call_id: String,
        output: Option<Value>,
        error: Option<String>,
    },
    CompactionStart,
    CompactionEnd { will_retry: bool },
}

/// One raw upstream record, with the routing and dedupe envelope fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub session_key: Option<String>,
    pub run_id: Option<String>,
    pub seq: Option<u64>,
    pub payload: RawPayload,
}

/// Parse a single line of raw agent output. Returns `None` for anything that
/// is not a well-formed, recognized record.
pub fn parse_raw_line(line: &str) -> Option<RawEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    parse_raw_value(value)
}

/// Parse an already-decoded raw record (broker frames arrive pre-decoded).
pub fn parse_raw_value(value: Value) -> Option<RawEvent> {
    let event = value.get("event")?.as_str()?;
    let session_key = string_field(&value, "sessionKey");
    let run_id = string_field(&value, "runId");
    let seq = value.get("globalSeq").and_then(Value::as_u64);
    let data = value.get("data").cloned().unwrap_or(Value::Null);

    let payload = match event {
        "error" => RawPayload::LifecycleError {
            message: string_field(&data, "message")
                .or_else(|| data.as_str().map(str::to_string))
                .unwrap_or_else(|| "agent reported an error".to_string()),
        },
        "agent" => parse_agent_payload(value.get("stream")?.as_str()?, &data)?,
        _ => return None,
    };

    Some(RawEvent {
        session_key,
        run_id,
        seq,
        payload,
    })
}

fn parse_agent_payload(stream: &str, data: &Value) -> Option<RawPayload> {
    match stream {
        "lifecycle" => match data.get("phase")?.as_str()? {
            "start" => Some(RawPayload::LifecycleStart),
            "end" => Some(RawPayload::LifecycleEnd),
            "error" => Some(RawPayload::LifecycleError {
                message: string_field(data, "message")
                    .unwrap_or_else(|| "agent reported an error".to_string()),
            }),
            _ => None,
        },
        "thinking" => Some(RawPayload::Thinking {
            delta: string_field(data, "text").or_else(|| string_field(data, "delta"))?,
        }),
        "assistant" => {
            let delta = string_field(data, "text").filter(|t| !t.is_empty());
            let media = data
                .get("media")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let error = match string_field(data, "stopReason").as_deref() {
                Some("error") => Some(
                    string_field(data, "error")
                        .unwrap_or_else(|| "agent returned an error".to_string()),
                ),
                _ => None,
            };
            Some(RawPayload::Assistant {
                delta,
                media,
                error,
            })
        }
        "tool" => match data.get("phase")?.as_str()? {
            "start" => Some(RawPayload::ToolStart {
                call_id: string_field(data, "callId")?,
                name: string_field(data, "name")?,
                args: data.get("args").cloned().unwrap_or(Value::Null),
            }),
            "result" => {
                let call_id = string_field(data, "callId")?;
                let error = string_field(data, "error");
                let output = if error.is_some() {
                    None
                } else {
                    Some(data.get("output").cloned().unwrap_or(Value::Null))
                };
                Some(RawPayload::ToolResult {
                    call_id,
                    output,
                    error,
                })
            }
            _ => None,
        },
        "compaction" => match data.get("phase")?.as_str()? {
            "start" => Some(RawPayload::CompactionStart),
            "end" => Some(RawPayload::CompactionEnd {
                will_retry: data
                    .get("willRetry")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            _ => None,
        },
        _ => None,
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}
