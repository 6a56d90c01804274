//! Stream Parser (component G) — tolerant consumer of the Agent CLI's
//! newline-delimited "stream-JSON" output (spec §4.2).
//!
//! Grounded in the spec's own re-architecture advice (§9): "prefer a small
//! extractor layer over generated struct types... keep the record as a
//! value, not a shared mutable; each line produces `next = consume(prev,
//! line)`". Mirrors the shape of
//! examples/clawde-io-apps/daemon/src/tasks/reducer.rs's `reduce(state,
//! event) -> state`, generalized from a fixed event enum to arbitrary JSON
//! shapes since the Agent's schema is explicitly not contractually stable.

use crate::approval::ActionClass;
use crate::redact::truncate_chars;
use serde_json::Value;

const TOOL_SUMMARY_MAX_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct PermissionDenial {
    pub action_class: ActionClass,
    pub description: String,
}

/// Progressively updated record accumulated across a run's stdout lines
/// (spec §4.2 "Output"). Immutable value — `consume` takes it by value and
/// returns the next state rather than mutating in place.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub assistant_text: String,
    pub tool_summaries: Vec<String>,
    pub session_ref: Option<String>,
    pub tokens_used: Option<i64>,
    pub permission_denied: Option<PermissionDenial>,
    pub replay_actions: Vec<String>,
    pub parse_warnings: Vec<String>,
    pub parse_failures: usize,
    pub lines_seen: usize,
    /// When true, tool-use summaries accumulate into `replay_actions`
    /// instead of `tool_summaries` (spec §4.5 rule 4: "every tool activity
    /// during the replay is recorded to the replay-actions list").
    replay_mode: bool,
}

impl StreamState {
    pub fn new(replay_mode: bool) -> Self {
        Self {
            assistant_text: String::new(),
            tool_summaries: Vec::new(),
            session_ref: None,
            tokens_used: None,
            permission_denied: None,
            replay_actions: Vec::new(),
            parse_warnings: Vec::new(),
            parse_failures: 0,
            lines_seen: 0,
            replay_mode,
        }
    }

    pub fn has_usable_text(&self) -> bool {
        !self.assistant_text.trim().is_empty() || !self.tool_summaries.is_empty()
    }
}

/// Consume one raw line of Agent output, producing the next state. Never
/// panics on malformed input — a failed parse increments `parse_failures`
/// and appends a truncated, caller-redacted copy of the line to
/// `parse_warnings` (spec §4.2 step 1).
pub fn consume(mut state: StreamState, line: &str, redact: impl Fn(&str) -> String) -> StreamState {
    let line = line.trim();
    if line.is_empty() {
        return state;
    }
    state.lines_seen += 1;

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            state.parse_failures += 1;
            state
                .parse_warnings
                .push(truncate_chars(&redact(line), 300));
            return state;
        }
    };

    if let Some(text) = extract_assistant_text(&value) {
        if !state.assistant_text.is_empty() {
            state.assistant_text.push('\n');
        }
        state.assistant_text.push_str(&text);
    }

    if let Some(summary) = extract_tool_summary(&value) {
        let truncated = truncate_chars(&summary, TOOL_SUMMARY_MAX_CHARS);
        if state.replay_mode {
            state.replay_actions.push(truncated);
        } else {
            state.tool_summaries.push(truncated);
        }
    }

    if state.session_ref.is_none() {
        if let Some(id) = extract_session_ref(&value) {
            state.session_ref = Some(id);
        }
    }

    if let Some(tokens) = extract_total_tokens(&value) {
        state.tokens_used = Some(tokens);
    }

    if state.permission_denied.is_none() {
        if let Some(denial) = extract_permission_denial(&value) {
            state.permission_denied = Some(denial);
        }
    }

    state
}

fn value_str(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn extract_assistant_text(v: &Value) -> Option<String> {
    let obj = v.as_object()?;

    let looks_like_assistant = obj
        .get("role")
        .and_then(Value::as_str)
        .map(|r| r == "assistant")
        .unwrap_or(false)
        || obj
            .get("type")
            .and_then(Value::as_str)
            .map(|t| t.starts_with("assistant"))
            .unwrap_or(false);

    if let Some(result) = value_str(v, "result") {
        return Some(result);
    }

    if let Some(text) = value_str(v, "text") {
        return Some(text);
    }

    if let Some(content) = obj.get("content") {
        if let Some(s) = content.as_str() {
            return Some(s.to_string());
        }
        if let Some(arr) = content.as_array() {
            let joined: Vec<String> = arr
                .iter()
                .filter_map(|item| {
                    let is_text = item.get("type").and_then(Value::as_str) == Some("text");
                    if is_text {
                        value_str(item, "text")
                    } else {
                        None
                    }
                })
                .collect();
            if !joined.is_empty() {
                return Some(joined.join(""));
            }
        }
    }

    if looks_like_assistant {
        return None;
    }
    None
}

fn extract_tool_summary(v: &Value) -> Option<String> {
    let obj = v.as_object()?;
    let tool = obj
        .get("tool_name")
        .or_else(|| obj.get("toolName"))
        .or_else(|| obj.get("name"))
        .and_then(Value::as_str)?;

    let summary = value_str(v, "summary")
        .or_else(|| value_str(v, "description"))
        .or_else(|| {
            obj.get("input")
                .map(|i| i.to_string())
        })
        .unwrap_or_default();

    Some(format!("{tool}: {summary}"))
}

fn extract_session_ref(v: &Value) -> Option<String> {
    value_str(v, "session_id").or_else(|| value_str(v, "conversation_id"))
}

fn extract_total_tokens(v: &Value) -> Option<i64> {
    v.get("usage")?.get("total_tokens")?.as_i64()
}

/// Conservative keyword detection (spec §4.2 step 6, §9 open question:
/// superseded by a structured event if/when the Agent CLI surfaces one).
fn extract_permission_denial(v: &Value) -> Option<PermissionDenial> {
    let haystack = format!(
        "{} {}",
        v.get("type").and_then(Value::as_str).unwrap_or(""),
        v.get("text")
            .or_else(|| v.get("result"))
            .and_then(Value::as_str)
            .unwrap_or("")
    )
    .to_lowercase();

    if haystack.contains("permission") && haystack.contains("denied") {
        let description = v
            .get("text")
            .or_else(|| v.get("result"))
            .and_then(Value::as_str)
            .unwrap_or("permission denied")
            .trim()
            .to_string();
        Some(PermissionDenial {
            action_class: ActionClass::classify(&description),
            description: truncate_chars(&description, 300),
        })
    } else {
        None
    }
}
