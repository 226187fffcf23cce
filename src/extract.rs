//! Session transcript extraction.
//!
//! Parses a JSONL event log into the user/assistant messages worth
//! indexing. Only events with `type = "message"` and a `user` or
//! `assistant` role are kept; tool calls, deltas, and malformed lines are
//! skipped without error.
//!
//! The transcript's file-level hash is computed over the output of
//! [`transcript_content`]: one whitespace-collapsed line per message,
//! prefixed with its role label, so any change to the indexed messages
//! changes the aggregate hash.

use serde_json::Value;

use crate::models::{ChunkRole, SessionMessage};

/// Extract the indexable messages from a raw JSONL transcript.
///
/// `key_prefix` seeds the synthetic per-message ids (`<prefix>#<n>`), which
/// are assigned here at index time and carried onto every chunk derived
/// from the message. When `recent_window > 0` only that many trailing
/// messages are kept.
pub fn extract_messages(raw: &str, key_prefix: &str, recent_window: usize) -> Vec<SessionMessage> {
    let mut messages = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if event.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let Some(message) = event.get("message") else {
            continue;
        };
        let role = match message.get("role").and_then(Value::as_str) {
            Some("user") => ChunkRole::User,
            Some("assistant") => ChunkRole::Assistant,
            _ => continue,
        };
        let text = content_text(message.get("content"));
        if text.is_empty() {
            continue;
        }

        messages.push(SessionMessage {
            role,
            text,
            message_id: String::new(),
            created_at: event_timestamp(&event, message),
        });
    }

    if recent_window > 0 && messages.len() > recent_window {
        messages.drain(..messages.len() - recent_window);
    }

    for (n, message) in messages.iter_mut().enumerate() {
        message.message_id = format!("{}#{}", key_prefix, n);
    }

    messages
}

/// Normalized transcript text the file-level hash is computed over.
pub fn transcript_content(messages: &[SessionMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(message.role.as_str());
        out.push_str(": ");
        out.push_str(&message.text);
        out.push('\n');
    }
    out
}

/// Collect a message's text. `content` is either a plain string or an
/// array of blocks, of which only text-bearing kinds contribute.
fn content_text(content: Option<&Value>) -> String {
    let raw = match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") | Some("thinking") | Some("reasoning") => {}
                    _ => continue,
                }
                let part = block
                    .get("text")
                    .or_else(|| block.get("thinking"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !part.is_empty() {
                    parts.push(part);
                }
            }
            parts.join(" ")
        }
        _ => String::new(),
    };

    collapse_whitespace(&raw)
}

/// Event timestamp in milliseconds: the numeric top-level timestamp when
/// present, otherwise the message's RFC 3339 timestamp string.
fn event_timestamp(event: &Value, message: &Value) -> Option<i64> {
    if let Some(ts) = event.get("timestamp") {
        if let Some(ms) = ts.as_i64() {
            return Some(ms);
        }
        if let Some(ms) = ts.as_f64() {
            return Some(ms as i64);
        }
    }
    let raw = message
        .get("timestamp")
        .or_else(|| event.get("timestamp"))
        .and_then(Value::as_str)?;
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_content_and_roles() {
        let raw = concat!(
            r#"{"type":"message","timestamp":1717243200000,"message":{"role":"user","content":"hello  there"}}"#,
            "\n",
            r#"{"type":"message","timestamp":1717243201000,"message":{"role":"assistant","content":"hi"}}"#,
            "\n",
            r#"{"type":"tool_result","message":{"role":"user","content":"ignored"}}"#,
        );
        let messages = extract_messages(raw, "s1", 0);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, ChunkRole::User);
        assert_eq!(messages[0].text, "hello there");
        assert_eq!(messages[0].message_id, "s1#0");
        assert_eq!(messages[0].created_at, Some(1717243200000));
        assert_eq!(messages[1].role, ChunkRole::Assistant);
        assert_eq!(messages[1].message_id, "s1#1");
    }

    #[test]
    fn block_content_filters_by_type() {
        let raw = r#"{"type":"message","message":{"role":"assistant","content":[
            {"type":"text","text":"visible"},
            {"type":"thinking","thinking":"pondering"},
            {"type":"tool_use","name":"run","input":{}},
            {"type":"reasoning","text":"because"}
        ]}}"#
            .replace('\n', "");
        let messages = extract_messages(&raw, "s", 0);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "visible pondering because");
    }

    #[test]
    fn system_and_malformed_lines_skipped() {
        let raw = concat!(
            "not json at all\n",
            r#"{"type":"message","message":{"role":"system","content":"prompt"}}"#,
            "\n",
            r#"{"type":"message","message":{"role":"user","content":""}}"#,
            "\n",
            r#"{"type":"message","message":{"role":"user","content":"kept"}}"#,
        );
        let messages = extract_messages(raw, "s", 0);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "kept");
    }

    #[test]
    fn string_timestamp_fallback() {
        let raw = r#"{"type":"message","message":{"role":"user","content":"x","timestamp":"2024-06-01T12:00:00Z"}}"#;
        let messages = extract_messages(raw, "s", 0);
        assert_eq!(messages[0].created_at, Some(1717243200000));
    }

    #[test]
    fn recent_window_keeps_tail() {
        let raw: String = (0..5)
            .map(|i| {
                format!(
                    r#"{{"type":"message","message":{{"role":"user","content":"m{}"}}}}"#,
                    i
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let messages = extract_messages(&raw, "s", 2);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "m3");
        assert_eq!(messages[1].text, "m4");
        // ids are assigned after windowing, over what is actually indexed
        assert_eq!(messages[0].message_id, "s#0");
    }

    #[test]
    fn transcript_content_is_role_labelled() {
        let raw = concat!(
            r#"{"type":"message","message":{"role":"user","content":"alpha bravo"}}"#,
            "\n",
            r#"{"type":"message","message":{"role":"assistant","content":"charlie"}}"#,
        );
        let messages = extract_messages(raw, "s", 0);
        assert_eq!(
            transcript_content(&messages),
            "user: alpha bravo\nassistant: charlie\n"
        );
    }
}
