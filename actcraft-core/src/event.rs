//! # Events
//!
//! Immutable records of each interaction turn, kept in an append-only
//! arena. A sequence number is the event's position in its log.

use crate::action::{Action, ActionKind};
use crate::error::{self, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    User,
    Agent,
    Environment,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::User => "user",
            EventSource::Agent => "agent",
            EventSource::Environment => "environment",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of executing an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl Observation {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// A non-zero exit code marks a failed command
    pub fn is_failure(&self) -> bool {
        matches!(self.exit_code, Some(code) if code != 0)
    }

    /// Text shown to the model
    pub fn render(&self) -> String {
        match self.exit_code {
            Some(code) => format!(
                "OBSERVATION:\n{}\n[Command finished with exit code {}]",
                self.content, code
            ),
            None => format!("OBSERVATION:\n{}", self.content),
        }
    }
}

/// What an event carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Action(Action),
    Observation(Observation),
    Message { content: String },
}

impl EventPayload {
    pub fn message(content: impl Into<String>) -> Self {
        EventPayload::Message {
            content: content.into(),
        }
    }
}

/// Event kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Action,
    Observation,
    Message,
}

/// Unit a history budget is measured in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetUnit {
    /// One per event
    #[default]
    Items,
    /// Approximate tokens of the rendered event
    Tokens,
}

/// Appended to an event cut down to fit a budget
pub const TRUNCATION_MARKER: &str = "[truncated]";

/// Rough estimate: 4 bytes per token
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4 + 1
}

/// A single turn of interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: u64,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Action(_) => EventKind::Action,
            EventPayload::Observation(_) => EventKind::Observation,
            EventPayload::Message { .. } => EventKind::Message,
        }
    }

    pub fn action(&self) -> Option<&Action> {
        match &self.payload {
            EventPayload::Action(action) => Some(action),
            _ => None,
        }
    }

    pub fn action_kind(&self) -> Option<ActionKind> {
        self.action().map(Action::kind)
    }

    /// The text that dominates this event's size
    pub fn text(&self) -> &str {
        match &self.payload {
            EventPayload::Action(action) => action.primary_text(),
            EventPayload::Observation(obs) => &obs.content,
            EventPayload::Message { content } => content,
        }
    }

    /// Exactly what a prompt shows for this event
    pub fn render(&self) -> String {
        match &self.payload {
            EventPayload::Action(action) => action.to_tagged(),
            EventPayload::Observation(obs) => obs.render(),
            EventPayload::Message { content } => content.clone(),
        }
    }

    /// Size of the rendered event in `unit`
    pub fn size(&self, unit: BudgetUnit) -> usize {
        match unit {
            BudgetUnit::Items => 1,
            BudgetUnit::Tokens => estimate_tokens(&self.render()),
        }
    }

    /// Copy whose rendering fits in `limit` tokens.
    ///
    /// The thought is dropped and the primary text cut, ending in
    /// [`TRUNCATION_MARKER`]. When not even the framing fits, the copy
    /// degrades to a message holding a prefix of the rendered text.
    pub fn truncated_to(&self, limit: usize) -> Event {
        let max_bytes = limit.saturating_sub(1) * 4;
        let framing = self.with_text(String::new()).render().len() + TRUNCATION_MARKER.len() + 1;

        if framing <= max_bytes {
            let kept = prefix(self.text(), max_bytes - framing);
            let cut = self.with_text(format!("{}\n{}", kept, TRUNCATION_MARKER));
            if cut.size(BudgetUnit::Tokens) <= limit {
                return cut;
            }
        }

        Event {
            payload: EventPayload::message(prefix(&self.render(), max_bytes)),
            ..self.clone()
        }
    }

    fn with_text(&self, text: String) -> Event {
        let payload = match &self.payload {
            EventPayload::Action(action) => {
                EventPayload::Action(action.clone().with_thought("").with_primary_text(text))
            }
            EventPayload::Observation(obs) => EventPayload::Observation(Observation {
                content: text,
                exit_code: obs.exit_code,
            }),
            EventPayload::Message { .. } => EventPayload::Message { content: text },
        };
        Event {
            payload,
            ..self.clone()
        }
    }
}

/// Longest prefix of `text` within `max_bytes`, on a char boundary
fn prefix(text: &str, max_bytes: usize) -> &str {
    let mut end = max_bytes.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Append-only event arena
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from stored events; sequence numbers must be 0..n
    pub fn from_events(events: Vec<Event>) -> Result<Self> {
        if let Some((pos, event)) = events
            .iter()
            .enumerate()
            .find(|(pos, event)| event.seq != *pos as u64)
        {
            return Err(error::invalid_argument(format!(
                "event at position {} has sequence number {}",
                pos, event.seq
            )));
        }
        Ok(Self { events })
    }

    pub fn append(&mut self, source: EventSource, payload: EventPayload) -> u64 {
        let seq = self.events.len() as u64;
        self.events.push(Event {
            seq,
            timestamp: current_timestamp(),
            source,
            payload,
        });
        seq
    }

    pub fn get(&self, seq: u64) -> Option<&Event> {
        usize::try_from(seq).ok().and_then(|i| self.events.get(i))
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn as_slice(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

pub(crate) fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
