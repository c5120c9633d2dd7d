//! C4 — JSONL Parser: projects an agent's append-only JSONL transcript into
//! the uniform `Message` model. Never aborts on a bad line — this mirrors
//! `FileAgentRepository::load_all`'s "warn, don't fail" posture for
//! individually corrupt records, applied line-by-line instead of file-by-file.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::types::{Message, SessionMetadata};

/// Raw shape of one JSONL line. Deliberately permissive — unknown or
/// missing fields default out rather than fail deserialization, since a
/// single field mismatch must not drop the whole record, only malformed
/// JSON should.
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    ts: Option<f64>,
    #[serde(default)]
    num_turns: Option<u64>,
    #[serde(default, rename = "total_cost_usd")]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Option<Value>,
}

fn record_timestamp(record: &RawRecord) -> DateTime<Utc> {
    if let Some(ts) = &record.timestamp {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
            return parsed.with_timezone(&Utc);
        }
    }
    if let Some(epoch_secs) = record.ts {
        if let Some(dt) = Utc.timestamp_millis_opt((epoch_secs * 1000.0) as i64).single() {
            return dt;
        }
    }
    Utc::now()
}

/// Content may be a plain string or an array of typed blocks. Array form is
/// flattened preserving order: interleaved text/tool_use blocks emit
/// interleaved messages (property: E6).
fn flatten_content(content: &Value, timestamp: DateTime<Utc>, role_is_assistant: bool) -> Vec<Message> {
    match content {
        Value::String(text) => {
            vec![if role_is_assistant {
                Message::Assistant { id: 0, content: text.clone(), timestamp }
            } else {
                Message::User { id: 0, content: text.clone(), timestamp }
            }]
        }
        Value::Array(blocks) => {
            let mut out = Vec::new();
            for block in blocks {
                let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");
                match block_type {
                    "text" => {
                        let text = block.get("text").and_then(Value::as_str).unwrap_or("").to_string();
                        out.push(if role_is_assistant {
                            Message::Assistant { id: 0, content: text, timestamp }
                        } else {
                            Message::User { id: 0, content: text, timestamp }
                        });
                    }
                    "tool_use" => {
                        let tool_id = block.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                        let tool_name = block.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                        let content = block
                            .get("input")
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        out.push(Message::ToolUse { id: 0, tool_id, tool_name, content, timestamp });
                    }
                    "tool_result" => {
                        let tool_id = block.get("tool_use_id").and_then(Value::as_str).unwrap_or("").to_string();
                        let content = match block.get("content") {
                            Some(Value::String(s)) => s.clone(),
                            Some(other) => other.to_string(),
                            None => String::new(),
                        };
                        out.push(Message::ToolResult { id: 0, tool_id, content, timestamp });
                    }
                    _ => {}
                }
            }
            out
        }
        _ => Vec::new(),
    }
}

/// Parses one JSONL line into zero or more messages (a single `assistant`
/// line with an interleaved content array can emit several). Returns an
/// empty vec, never an error, on malformed JSON (property 8).
pub fn parse_line(line: &str) -> Vec<Message> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let record: RawRecord = match serde_json::from_str(trimmed) {
        Ok(r) => r,
        Err(_) => return Vec::new(),
    };

    let timestamp = record_timestamp(&record);

    match record.kind.as_str() {
        "system" => {
            // A bare session-init record carries no user-visible content.
            if record.subtype.as_deref() == Some("init") || record.subtype.as_deref() == Some("session_init") {
                return Vec::new();
            }
            let content = record
                .subtype
                .clone()
                .unwrap_or_else(|| "system event".to_string());
            vec![Message::System { id: 0, content, timestamp }]
        }
        "user" => {
            let content = record
                .message
                .as_ref()
                .and_then(|m| m.content.as_ref())
                .or(record.content.as_ref());
            match content {
                Some(v) => flatten_content(v, timestamp, false),
                None => Vec::new(),
            }
        }
        "assistant" => {
            let content = record
                .message
                .as_ref()
                .and_then(|m| m.content.as_ref())
                .or(record.content.as_ref());
            match content {
                Some(v) => flatten_content(v, timestamp, true),
                None => Vec::new(),
            }
        }
        "tool_use" => {
            let tool_id = record.name.clone().unwrap_or_default();
            let content = record.content.as_ref().map(|v| v.to_string()).unwrap_or_default();
            vec![Message::ToolUse {
                id: 0,
                tool_id,
                tool_name: record.name.clone().unwrap_or_default(),
                content,
                timestamp,
            }]
        }
        "tool_result" => {
            let content = record.content.as_ref().map(|v| v.to_string()).unwrap_or_default();
            vec![Message::ToolResult { id: 0, tool_id: String::new(), content, timestamp }]
        }
        "result" => {
            let content = if record.subtype.as_deref() == Some("success") {
                format!(
                    "Session completed: {} turns, ${:.4}",
                    record.num_turns.unwrap_or(0),
                    record.total_cost_usd.unwrap_or(0.0)
                )
            } else {
                record.subtype.clone().unwrap_or_else(|| "result".to_string())
            };
            vec![Message::System { id: 0, content, timestamp }]
        }
        _ => Vec::new(),
    }
}

/// Pulls the agent CLI's own session id off a raw line, if present, whatever
/// the record's `type`. The id typically rides on the `system`/`init` record
/// that `parse_line` elides, so this is consulted separately rather than
/// folded into the `Message` it would otherwise produce.
pub fn extract_native_id(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let record: RawRecord = serde_json::from_str(trimmed).ok()?;
    record.session_id
}

/// Parses a whole transcript, skipping unparseable lines.
pub fn parse_transcript(contents: &str) -> Vec<Message> {
    contents.lines().flat_map(parse_line).collect()
}

/// Derives metadata without assigning monotonic ids (those belong to the
/// live session manager, not the static parser).
pub fn session_metadata(path: &std::path::Path, _agent_kind: crate::types::AgentKind) -> std::io::Result<SessionMetadata> {
    let contents = std::fs::read_to_string(path)?;
    let meta = std::fs::metadata(path)?;
    let last_activity = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .and_then(|d| Utc.timestamp_opt(d.as_secs() as i64, 0).single())
        .unwrap_or_else(Utc::now);

    let project_path = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().replace('-', "/"));

    let messages = parse_transcript(&contents);
    let message_count = messages.len();
    let first_prompt = messages.iter().find_map(|m| match m {
        Message::User { content, .. } => Some(truncate(content, 200)),
        _ => None,
    });

    let display_name = contents.lines().find_map(|line| {
        let record: RawRecord = serde_json::from_str(line.trim()).ok()?;
        if record.kind == "system" && record.subtype.as_deref() == Some("session_name") {
            record.name
        } else {
            None
        }
    });

    Ok(SessionMetadata {
        project_path,
        message_count,
        last_activity,
        first_prompt,
        display_name,
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_line_is_skipped() {
        let input = "{\"type\":\"user\",\"message\":{\"content\":\"hi\"}}\nnot json at all\n";
        let messages = parse_transcript(input);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn interleaved_text_and_tool_use_preserves_order() {
        let line = serde_json::json!({
            "type": "assistant",
            "message": {
                "content": [
                    {"type": "text", "text": "A"},
                    {"type": "tool_use", "id": "t1", "name": "Read"},
                    {"type": "text", "text": "B"},
                    {"type": "tool_use", "id": "t2", "name": "Read"},
                ]
            }
        })
        .to_string();

        let messages = parse_line(&line);
        assert_eq!(messages.len(), 4);
        assert!(matches!(&messages[0], Message::Assistant { content, .. } if content == "A"));
        assert!(matches!(&messages[1], Message::ToolUse { tool_id, tool_name, .. } if tool_id == "t1" && tool_name == "Read"));
        assert!(matches!(&messages[2], Message::Assistant { content, .. } if content == "B"));
        assert!(matches!(&messages[3], Message::ToolUse { tool_id, .. } if tool_id == "t2"));
    }

    #[test]
    fn result_success_emits_synthetic_system_message() {
        let line = serde_json::json!({
            "type": "result",
            "subtype": "success",
            "num_turns": 3,
            "total_cost_usd": 0.1234,
        })
        .to_string();

        let messages = parse_line(&line);
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], Message::System { content, .. } if content == "Session completed: 3 turns, $0.1234"));
    }

    #[test]
    fn system_init_subtype_is_elided() {
        let line = serde_json::json!({"type": "system", "subtype": "init"}).to_string();
        assert!(parse_line(&line).is_empty());
    }

    #[test]
    fn session_name_subtype_surfaces_as_system_message() {
        let line = serde_json::json!({"type": "system", "subtype": "session_name", "name": "fix flaky test"}).to_string();
        let messages = parse_line(&line);
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], Message::System { content, .. } if content == "session_name"));
    }

    #[test]
    fn extract_native_id_reads_session_id_off_init_record() {
        let line = serde_json::json!({"type": "system", "subtype": "init", "session_id": "abc-123"}).to_string();
        assert_eq!(extract_native_id(&line).as_deref(), Some("abc-123"));
        assert!(extract_native_id("not json").is_none());
    }

    #[test]
    fn epoch_seconds_timestamp_is_converted_to_millis_precision() {
        let line = serde_json::json!({
            "type": "user",
            "message": {"content": "hi"},
            "ts": 1_700_000_000.0,
        })
        .to_string();
        let messages = parse_line(&line);
        match &messages[0] {
            Message::User { timestamp, .. } => assert_eq!(timestamp.timestamp(), 1_700_000_000),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
