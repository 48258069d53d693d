//! Classifies decoded stream lines into signals for the session.

use serde_json::{Map, Value};

const DATA_PREFIX: &str = "data:";
const EVENT_PREFIX: &str = "event:";
const DONE_EVENT: &str = "done";

/// A classified frame from the chat stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    /// Incremental assistant text.
    Delta(String),
    /// The backend finished the turn.
    Done,
    /// The backend reported an error inside an otherwise healthy stream.
    Error(String),
}

impl StreamSignal {
    /// Returns true if no further lines should be processed after this signal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamSignal::Done | StreamSignal::Error(_))
    }
}

/// Structured payload carried by a `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    Text(String),
    Failure(String),
    Empty,
}

impl Payload {
    /// Classifies a decoded JSON record.
    ///
    /// Field types are not enforced: a truthy `message` of any type is a
    /// failure, and a present `text` is appended as-is (non-strings as their
    /// JSON text). An error discards whatever text arrived with it, so it
    /// wins.
    fn from_record(record: &Map<String, Value>) -> Self {
        if let Some(message) = record.get("message").filter(|value| is_truthy(value)) {
            return Payload::Failure(render(message));
        }
        match record.get("text") {
            Some(Value::Null) | None => Payload::Empty,
            Some(text) => Payload::Text(render(text)),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n.abs() > 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Interprets one decoded line.
///
/// Returns `None` for keep-alives, comments, empty records, unknown events
/// and malformed payloads. Malformed frames are never fatal.
pub fn interpret(line: &str) -> Option<StreamSignal> {
    let line = line.trim_end();
    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }

    if let Some(raw) = line.strip_prefix(DATA_PREFIX) {
        return match parse_payload(raw.trim())? {
            Payload::Text(text) => Some(StreamSignal::Delta(text)),
            Payload::Failure(message) => Some(StreamSignal::Error(message)),
            Payload::Empty => None,
        };
    }

    if let Some(name) = line.strip_prefix(EVENT_PREFIX) {
        // `event: error` carries its message in the next data line.
        return (name.trim() == DONE_EVENT).then_some(StreamSignal::Done);
    }

    None
}

fn parse_payload(raw: &str) -> Option<Payload> {
    if raw.is_empty() || raw == "{}" {
        return Some(Payload::Empty);
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(record)) => Some(Payload::from_record(&record)),
        Ok(_) => {
            tracing::trace!(payload = raw, "Dropping non-object frame");
            None
        }
        Err(err) => {
            tracing::trace!(payload = raw, error = %err, "Dropping malformed frame");
            None
        }
    }
}
