// ── Flow: Tool-Call Stream Interceptor ─────────────────────────────────────
//
// Consumes the model's token stream and splits it into user-visible text
// and structured tool-call events. Two in-stream encodings are recognized:
//
//   XML form:   <tool_call> {...json...} </tool_call>   (repeatable)
//   JSON form:  a top-level object beginning with "tool_calls", optionally
//               inside a ```json-tool-calls fence, after any </think> fence
//
// The parser is a tagged state machine {Safe, MaybeToolPrefix, InToolCall}
// over a rolling buffer. Text is only forwarded once it provably cannot be
// the start of a marker: the tail is held back while it matches any marker
// prefix. Once a marker is confirmed, forwarding stops permanently — the
// payload never reaches the user.

use log::warn;
use serde_json::Value;
use std::collections::HashMap;

/// Markers that must never leak into the user-visible stream.
const XML_MARKER: &str = "<tool_call";
const XML_SHORT_MARKER: &str = "<tool";
const FENCE_MARKER: &str = "```json-tool-calls";
const THINK_CLOSE: &str = "</think>";

/// Stop sequences the orchestrator must ensure on the request.
/// `</tool_call>` is deliberately absent: stopping there would cut off
/// parallel tool calls.
const REQUIRED_STOP_SEQUENCES: &[&str] = &["<|im_end|>", "<|im_start|>", "<tool_response>"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Forwarding text, tail held back while it could open a marker.
    Safe,
    /// A confirmed marker was seen; everything from it is payload.
    InToolCall,
}

/// A parsed tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Events produced while consuming the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum InterceptEvent {
    /// Text safe to show the user.
    Forward(String),
    /// Complete tool calls extracted from the payload.
    ToolCalls(Vec<ParsedToolCall>),
}

pub struct ToolCallStreamInterceptor {
    buffer: String,
    state: ScanState,
    /// Offset into `buffer` where the detected payload starts.
    payload_start: usize,
}

impl Default for ToolCallStreamInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallStreamInterceptor {
    pub fn new() -> Self {
        ToolCallStreamInterceptor {
            buffer: String::new(),
            state: ScanState::Safe,
            payload_start: 0,
        }
    }

    /// Whether a tool-call payload has been detected on this stream.
    pub fn in_tool_call(&self) -> bool {
        self.state == ScanState::InToolCall
    }

    /// Feed one model chunk; returns the events it unlocked.
    pub fn push(&mut self, chunk: &str) -> Vec<InterceptEvent> {
        self.buffer.push_str(chunk);
        if self.state == ScanState::InToolCall {
            // Payload accumulates until finish(); nothing is forwarded.
            return vec![];
        }

        let mut events = Vec::new();
        match earliest_marker(&self.buffer) {
            Some(at) => {
                // Forward the proven-safe prefix, then stop forever.
                let safe: String = self.buffer[..at].to_string();
                if !safe.is_empty() {
                    events.push(InterceptEvent::Forward(safe));
                }
                self.payload_start = at;
                self.state = ScanState::InToolCall;
            }
            None => {
                // Hold back however much of the tail could still open a
                // marker; forward the rest.
                let hold = hold_back_len(&self.buffer);
                let safe_len = self.buffer.len() - hold;
                if safe_len > 0 {
                    // Respect char boundaries (markers are pure ASCII, but
                    // the surrounding text is not).
                    let mut cut = safe_len;
                    while !self.buffer.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    if cut > 0 {
                        let safe: String = self.buffer.drain(..cut).collect();
                        events.push(InterceptEvent::Forward(safe));
                    }
                }
            }
        }
        events
    }

    /// Flush at stream end: either the held-back tail (plain answer) or the
    /// parsed tool calls.
    pub fn finish(&mut self) -> Vec<InterceptEvent> {
        match self.state {
            ScanState::Safe => {
                let rest: String = std::mem::take(&mut self.buffer);
                if rest.is_empty() {
                    vec![]
                } else {
                    vec![InterceptEvent::Forward(rest)]
                }
            }
            ScanState::InToolCall => {
                let payload = &self.buffer[self.payload_start..];
                let calls = parse_tool_call_payload(payload);
                if calls.is_empty() {
                    warn!("[flow] Tool-call payload did not parse ({} bytes held)", payload.len());
                }
                self.buffer.clear();
                self.state = ScanState::Safe;
                self.payload_start = 0;
                vec![InterceptEvent::ToolCalls(calls)]
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Marker scanning
// ═══════════════════════════════════════════════════════════════════════════

/// Earliest confirmed unsafe marker in the buffer, if any.
fn earliest_marker(buffer: &str) -> Option<usize> {
    let mut earliest: Option<usize> = None;
    let mut consider = |idx: Option<usize>| {
        if let Some(i) = idx {
            earliest = Some(earliest.map_or(i, |e| e.min(i)));
        }
    };
    consider(buffer.find(XML_MARKER));
    consider(buffer.find(FENCE_MARKER));
    consider(find_json_payload_start(buffer));
    earliest
}

/// Find a top-level `{ "tool_calls" ...` object start. The JSON form only
/// counts after any `</think>` fence (reasoning text may mention the word).
fn find_json_payload_start(buffer: &str) -> Option<usize> {
    let search_from = buffer.rfind(THINK_CLOSE).map(|i| i + THINK_CLOSE.len()).unwrap_or(0);
    let region = &buffer[search_from..];

    let bytes = region.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'{' {
            continue;
        }
        let mut j = i + 1;
        while j < bytes.len() && (bytes[j] as char).is_whitespace() {
            j += 1;
        }
        if region[j..].starts_with("\"tool_calls\"") {
            return Some(search_from + i);
        }
    }
    None
}

/// How many tail characters must stay buffered because they match a prefix
/// of some marker (so a marker split across chunks cannot leak).
fn hold_back_len(buffer: &str) -> usize {
    let mut hold = 0usize;

    for marker in [XML_MARKER, XML_SHORT_MARKER, FENCE_MARKER] {
        let max = marker.len().min(buffer.len());
        for k in (1..=max).rev() {
            if buffer.ends_with(&marker[..k]) {
                hold = hold.max(k);
                break;
            }
        }
    }

    // JSON payload start: `{` ws* `"tool_calls"` — check whether the tail is
    // a prefix of that pattern.
    hold.max(json_prefix_hold(buffer))
}

fn json_prefix_hold(buffer: &str) -> usize {
    // Scan backwards for a `{` within the plausible prefix window,
    // starting at a char boundary (the surrounding text is not ASCII).
    let mut start = buffer.len().saturating_sub(32);
    while start < buffer.len() && !buffer.is_char_boundary(start) {
        start += 1;
    }
    let tail = &buffer[start..];
    let Some(brace) = tail.rfind('{') else { return 0 };
    let after = &tail[brace + 1..];
    let key = "\"tool_calls\"";

    let trimmed = after.trim_start();
    let consumed_ws = after.len() - trimmed.len();
    // Everything after optional whitespace must be a prefix of the key.
    if trimmed.len() <= key.len() && key.starts_with(trimmed) {
        // `{` + whitespace + partial key are all still ambiguous.
        1 + consumed_ws + trimmed.len()
    } else {
        0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Payload parsing
// ═══════════════════════════════════════════════════════════════════════════

/// Parse a detected payload: repeated XML blocks, or a JSON object with a
/// top-level `tool_calls` array (fenced or bare).
pub fn parse_tool_call_payload(payload: &str) -> Vec<ParsedToolCall> {
    let mut calls = Vec::new();

    // XML form first: <tool_call> {...} </tool_call>, possibly repeated.
    let mut rest = payload;
    while let Some(open) = rest.find(XML_MARKER) {
        let after_open = match rest[open..].find('>') {
            Some(gt) => open + gt + 1,
            None => break,
        };
        let inner_end = rest[after_open..]
            .find("</tool_call>")
            .map(|i| after_open + i)
            .unwrap_or(rest.len());
        let inner = rest[after_open..inner_end].trim();
        if let Some(call) = parse_single_call_json(inner) {
            calls.push(call);
        }
        rest = &rest[inner_end..];
        match rest.find('>') {
            Some(gt) => rest = &rest[gt + 1..],
            None => break,
        }
    }
    if !calls.is_empty() {
        return calls;
    }

    // JSON form: strip fences, find the object, read `tool_calls`.
    let cleaned = strip_fences(payload);
    let Some(start) = cleaned.find('{') else { return calls };
    let Some(object) = balanced_object(&cleaned[start..]) else { return calls };
    let Ok(value) = serde_json::from_str::<Value>(object) else { return calls };

    if let Some(list) = value.get("tool_calls").and_then(|v| v.as_array()) {
        for entry in list {
            if let Some(call) = parse_call_entry(entry) {
                calls.push(call);
            }
        }
    }
    calls
}

/// One `{"name": ..., "arguments": {...}}` object (XML inner payload).
fn parse_single_call_json(inner: &str) -> Option<ParsedToolCall> {
    let cleaned = strip_fences(inner);
    let start = cleaned.find('{')?;
    let object = balanced_object(&cleaned[start..])?;
    let value = serde_json::from_str::<Value>(object).ok()?;
    parse_call_entry(&value)
}

/// Accept both `{name, arguments}` and OpenAI-style `{function: {name,
/// arguments}}` entries; arguments may be a JSON string needing a second
/// parse.
fn parse_call_entry(entry: &Value) -> Option<ParsedToolCall> {
    let (name, raw_args) = if let Some(function) = entry.get("function") {
        (function.get("name")?, function.get("arguments"))
    } else {
        (entry.get("name")?, entry.get("arguments"))
    };
    let name = name.as_str()?.trim().to_string();
    if name.is_empty() {
        return None;
    }

    let arguments = match raw_args {
        Some(Value::String(s)) => serde_json::from_str::<Value>(s).unwrap_or(Value::Null),
        Some(v) => v.clone(),
        None => Value::Object(serde_json::Map::new()),
    };
    Some(ParsedToolCall { name, arguments: sanitize_arguments(arguments) })
}

/// Extract the first balanced `{...}` from the start of `s`, string-aware.
fn balanced_object(s: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop markdown fences wherever the model wrapped the payload in one.
fn strip_fences(s: &str) -> String {
    s.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Argument hygiene: strip wrapping backticks from strings, trim URL-typed
/// fields. Applied recursively.
pub fn sanitize_arguments(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sanitized = map
                .into_iter()
                .map(|(key, v)| {
                    let v = match v {
                        Value::String(s) => {
                            let stripped = s.trim_matches('`').to_string();
                            let is_url_field = key == "url"
                                || key == "uri"
                                || key.ends_with("_url")
                                || key.ends_with("_uri");
                            Value::String(if is_url_field {
                                stripped.trim().to_string()
                            } else {
                                stripped
                            })
                        }
                        other => sanitize_arguments(other),
                    };
                    (key, v)
                })
                .collect();
            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_arguments).collect()),
        other => other,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Stop sequences
// ═══════════════════════════════════════════════════════════════════════════

/// Ensure the required stop sequences are present and `</tool_call>` is not
/// (it would break parallel tool calls).
pub fn ensure_stop_sequences(mut existing: Vec<String>) -> Vec<String> {
    existing.retain(|s| s != "</tool_call>");
    for required in REQUIRED_STOP_SEQUENCES {
        if !existing.iter().any(|s| s == required) {
            existing.push((*required).to_string());
        }
    }
    existing
}

// ═══════════════════════════════════════════════════════════════════════════
// Loop guard
// ═══════════════════════════════════════════════════════════════════════════

/// Injected when the guard trips.
pub const LOOP_GUARD_INSTRUCTION: &str =
    "stop looping; answer from evidence already gathered";

/// Markers of a block/CAPTCHA page in a tool result.
const BLOCKED_MARKERS: &[&str] = &[
    "unusual traffic",
    "robots.txt",
    "captcha",
    "are you a robot",
    "access denied",
    "rate limit exceeded",
];

pub fn is_blocked_response(body: &str) -> bool {
    let lower = body.to_lowercase();
    BLOCKED_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVerdict {
    Allow,
    /// The call repeats past the limit; suppress it and inject the
    /// corrective instruction.
    Suppress,
}

/// Turn-scoped counter of `(tool_name, canonicalized_args)` repetitions.
/// Blocked results count double so a blocked endpoint trips faster.
pub struct LoopGuard {
    counts: HashMap<(String, String), u32>,
    limit: u32,
}

impl LoopGuard {
    pub fn new(limit: u32) -> Self {
        LoopGuard { counts: HashMap::new(), limit: limit.max(1) }
    }

    /// Register an attempted call; returns the verdict for this attempt.
    pub fn register(&mut self, name: &str, arguments: &Value) -> LoopVerdict {
        let key = (name.to_string(), canonical_json(arguments));
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        if *count >= self.limit {
            LoopVerdict::Suppress
        } else {
            LoopVerdict::Allow
        }
    }

    /// A blocked result makes the same repetition trip sooner.
    pub fn note_blocked(&mut self, name: &str, arguments: &Value) {
        let key = (name.to_string(), canonical_json(arguments));
        *self.counts.entry(key).or_insert(0) += 1;
    }
}

/// Key-sorted serialization so argument ordering cannot defeat dedup.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
