use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HarnessError, HarnessResult};
use crate::synth::{FieldSet, RESERVED_PREFIX, SEQUENCE_FIELD};

const TAGS_FIELD: &str = "tags";

/// A single event emitted by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(FieldSet);

impl Event {
    pub fn new(fields: FieldSet) -> Self {
        Self(fields)
    }

    /// Parse one serialized event line.
    pub fn parse(line: &str) -> HarnessResult<Self> {
        match serde_json::from_str::<Value>(line)? {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(HarnessError::MalformedEvent(format!(
                "expected an object, got {other}"
            ))),
        }
    }

    pub fn fields(&self) -> &FieldSet {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String tags of the event; non-string entries are skipped.
    pub fn tags(&self) -> Vec<&str> {
        match self.0.get(TAGS_FIELD) {
            Some(Value::Array(tags)) => tags.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Sequence number stamped by the harness, 0 when absent or unreadable.
    pub fn sequence(&self) -> i64 {
        match self.0.get(SEQUENCE_FIELD) {
            Some(Value::Number(number)) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|value| value as i64))
                .unwrap_or(0),
            Some(Value::String(text)) => text.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Drop the sequence field and every reserved tag. An emptied tag list is
    /// removed altogether.
    pub fn strip_harness_fields(&mut self) {
        self.0.remove(SEQUENCE_FIELD);
        if let Some(Value::Array(tags)) = self.0.get_mut(TAGS_FIELD) {
            tags.retain(|tag| !tag.as_str().is_some_and(|tag| tag.starts_with(RESERVED_PREFIX)));
            if tags.is_empty() {
                self.0.remove(TAGS_FIELD);
            }
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Event> for Value {
    fn from(event: Event) -> Self {
        event.into_value()
    }
}

/// Order a raw result batch by sequence number and, unless `debug` is set,
/// strip everything the harness injected.
pub fn post_process(lines: &[String], debug: bool) -> HarnessResult<Vec<Event>> {
    let mut events = lines
        .iter()
        .map(|line| Event::parse(line))
        .collect::<HarnessResult<Vec<_>>>()?;

    // Stable, so events without an id keep their arrival order.
    events.sort_by_key(Event::sequence);

    if !debug {
        for event in &mut events {
            event.strip_harness_fields();
        }
    }
    Ok(events)
}
