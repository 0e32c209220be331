//! # Actions
//!
//! Structured instructions emitted by the agent and carried out by an
//! external executor. The wire format is `{"action": <kind>, "args": {...}}`.

use crate::error::{self, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

fn default_end() -> i64 {
    -1
}

/// A typed action with the fields its executor needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "args", rename_all = "snake_case")]
pub enum Action {
    /// Run a shell command
    Run {
        command: String,
        #[serde(default)]
        thought: String,
    },
    /// Read a file (line range, `end = -1` reads to EOF)
    Read {
        path: String,
        #[serde(default)]
        start: usize,
        #[serde(default = "default_end")]
        end: i64,
        #[serde(default)]
        thought: String,
    },
    /// Write a whole file
    Write {
        path: String,
        content: String,
        #[serde(default)]
        thought: String,
    },
    /// Replace one occurrence of `old_str` with `new_str`
    Edit {
        path: String,
        old_str: String,
        new_str: String,
        #[serde(default)]
        thought: String,
    },
    /// Open a URL
    Browse {
        url: String,
        #[serde(default)]
        thought: String,
    },
    /// Talk to the user
    Message {
        content: String,
        #[serde(default)]
        wait_for_response: bool,
    },
    /// Task is done
    Finish {
        #[serde(default)]
        outputs: serde_json::Map<String, serde_json::Value>,
        #[serde(default)]
        thought: String,
    },
    /// Task cannot be done
    Reject {
        #[serde(default)]
        outputs: serde_json::Map<String, serde_json::Value>,
        #[serde(default)]
        thought: String,
    },
}

/// Discriminant of [`Action`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Run,
    Read,
    Write,
    Edit,
    Browse,
    Message,
    Finish,
    Reject,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Run => "run",
            ActionKind::Read => "read",
            ActionKind::Write => "write",
            ActionKind::Edit => "edit",
            ActionKind::Browse => "browse",
            ActionKind::Message => "message",
            ActionKind::Finish => "finish",
            ActionKind::Reject => "reject",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Action {
    pub fn run(command: impl Into<String>) -> Self {
        Action::Run {
            command: command.into(),
            thought: String::new(),
        }
    }

    pub fn message(content: impl Into<String>) -> Self {
        Action::Message {
            content: content.into(),
            wait_for_response: false,
        }
    }

    pub fn finish() -> Self {
        Action::Finish {
            outputs: serde_json::Map::new(),
            thought: String::new(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Run { .. } => ActionKind::Run,
            Action::Read { .. } => ActionKind::Read,
            Action::Write { .. } => ActionKind::Write,
            Action::Edit { .. } => ActionKind::Edit,
            Action::Browse { .. } => ActionKind::Browse,
            Action::Message { .. } => ActionKind::Message,
            Action::Finish { .. } => ActionKind::Finish,
            Action::Reject { .. } => ActionKind::Reject,
        }
    }

    /// Terminal actions end the agent's run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Finish { .. } | Action::Reject { .. })
    }

    /// Attach reasoning text to actions that carry one
    pub fn with_thought(mut self, text: impl Into<String>) -> Self {
        match &mut self {
            Action::Run { thought, .. }
            | Action::Read { thought, .. }
            | Action::Write { thought, .. }
            | Action::Edit { thought, .. }
            | Action::Browse { thought, .. }
            | Action::Finish { thought, .. }
            | Action::Reject { thought, .. } => *thought = text.into(),
            Action::Message { .. } => {}
        }
        self
    }

    /// Check the fields an executor cannot do without
    pub fn validate(&self) -> Result<()> {
        let missing = match self {
            Action::Run { command, .. } if command.trim().is_empty() => Some("command"),
            Action::Read { path, .. }
            | Action::Write { path, .. }
            | Action::Edit { path, .. }
                if path.trim().is_empty() =>
            {
                Some("path")
            }
            Action::Edit { old_str, .. } if old_str.is_empty() => Some("old_str"),
            Action::Browse { url, .. } if url.trim().is_empty() => Some("url"),
            Action::Message { content, .. } if content.trim().is_empty() => Some("content"),
            _ => None,
        };

        match missing {
            Some(field) => Err(error::action_parse(
                format!("{} action is missing '{}'", self.kind(), field),
                &self.to_tagged(),
            )
            .with_context("field", field)),
            None => Ok(()),
        }
    }

    /// The free-text field that dominates this action's size
    pub fn primary_text(&self) -> &str {
        match self {
            Action::Run { command, .. } => command,
            Action::Read { path, .. } => path,
            Action::Write { content, .. } => content,
            Action::Edit { new_str, .. } => new_str,
            Action::Browse { url, .. } => url,
            Action::Message { content, .. } => content,
            Action::Finish { thought, .. } | Action::Reject { thought, .. } => thought,
        }
    }

    /// Copy of this action with its primary text replaced
    pub fn with_primary_text(&self, text: String) -> Action {
        let mut action = self.clone();
        match &mut action {
            Action::Run { command, .. } => *command = text,
            Action::Read { path, .. } => *path = text,
            Action::Write { content, .. } => *content = text,
            Action::Edit { new_str, .. } => *new_str = text,
            Action::Browse { url, .. } => *url = text,
            Action::Message { content, .. } => *content = text,
            Action::Finish { thought, .. } | Action::Reject { thought, .. } => *thought = text,
        }
        action
    }

    /// Render in the tag syntax a program's completions use.
    ///
    /// Edits have no tag form and render as JSON.
    pub fn to_tagged(&self) -> String {
        let prefix = |thought: &str| {
            if thought.is_empty() {
                String::new()
            } else {
                format!("{}\n", thought)
            }
        };

        match self {
            Action::Run { command, thought } => {
                format!("{}<execute_bash>{}</execute_bash>", prefix(thought), command)
            }
            Action::Read { path, thought, .. } => {
                format!("{}<read_file>{}</read_file>", prefix(thought), path)
            }
            Action::Write { path, content, thought } => format!(
                "{}<write_file path=\"{}\">\n{}\n</write_file>",
                prefix(thought),
                path,
                content
            ),
            Action::Browse { url, thought } => {
                format!("{}<execute_browse>{}</execute_browse>", prefix(thought), url)
            }
            Action::Message { content, .. } => format!("<message>{}</message>", content),
            Action::Finish { thought, .. } => format!("<finish>{}</finish>", thought),
            Action::Reject { thought, .. } => format!("<reject>{}</reject>", thought),
            Action::Edit { .. } => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

// ============================================================================
// Parsing completions into actions
// ============================================================================

const TAGS: &[&str] = &[
    "execute_bash",
    "execute_browse",
    "read_file",
    "write_file",
    "message",
    "finish",
    "reject",
];

/// Parse every action contained in a completion, in textual order.
///
/// Tag syntax is tried first; otherwise the text (markdown fences
/// stripped) must be a JSON action object or an array of them.
pub fn parse_actions(text: &str) -> Result<Vec<Action>> {
    let actions = match parse_tagged(text)? {
        Some(actions) => actions,
        None => parse_json(text)?,
    };

    if actions.is_empty() {
        return Err(error::action_parse("completion contains no action", text));
    }
    for action in &actions {
        action.validate()?;
    }
    Ok(actions)
}

/// Parse a completion that must hold exactly one leading action
pub fn parse_action(text: &str) -> Result<Action> {
    parse_actions(text).map(|mut actions| actions.swap_remove(0))
}

fn find_open(haystack: &str, tag: &str) -> Option<usize> {
    let needle = format!("<{}", tag);
    let mut offset = 0;
    while let Some(pos) = haystack[offset..].find(&needle) {
        let at = offset + pos;
        let next = haystack[at + needle.len()..].chars().next();
        if matches!(next, Some('>') | Some('/')) || next.is_some_and(char::is_whitespace) {
            return Some(at);
        }
        offset = at + needle.len();
    }
    None
}

fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let key = format!("{}=\"", name);
    let start = attrs.find(&key)? + key.len();
    let len = attrs[start..].find('"')?;
    Some(&attrs[start..start + len])
}

fn strip_newlines(body: &str) -> &str {
    let body = body.strip_prefix('\n').unwrap_or(body);
    body.strip_suffix('\n').unwrap_or(body)
}

fn parse_tagged(text: &str) -> Result<Option<Vec<Action>>> {
    let mut actions = Vec::new();
    let mut rest = text;

    loop {
        let next = TAGS
            .iter()
            .filter_map(|tag| find_open(rest, tag).map(|pos| (pos, *tag)))
            .min_by_key(|(pos, _)| *pos);
        let Some((pos, tag)) = next else { break };

        let leading = rest[..pos].trim();
        let after_name = &rest[pos + 1 + tag.len()..];
        let close = after_name
            .find('>')
            .ok_or_else(|| error::action_parse(format!("unterminated <{}> tag", tag), text))?;
        let attrs = &after_name[..close];

        let body = if attrs.trim_end().ends_with('/') {
            rest = &after_name[close + 1..];
            ""
        } else {
            let inner = &after_name[close + 1..];
            let closing = format!("</{}>", tag);
            let end = inner
                .find(&closing)
                .ok_or_else(|| error::action_parse(format!("missing {}", closing), text))?;
            rest = &inner[end + closing.len()..];
            &inner[..end]
        };

        let action = match tag {
            "execute_bash" => Action::run(body.trim()),
            "execute_browse" => Action::Browse {
                url: body.trim().to_string(),
                thought: String::new(),
            },
            "read_file" => Action::Read {
                path: body.trim().to_string(),
                start: 0,
                end: -1,
                thought: String::new(),
            },
            "write_file" => Action::Write {
                path: attribute(attrs, "path").unwrap_or_default().to_string(),
                content: strip_newlines(body).to_string(),
                thought: String::new(),
            },
            "message" => Action::message(body.trim()),
            "finish" => Action::finish().with_thought(body.trim()),
            "reject" => Action::Reject {
                outputs: serde_json::Map::new(),
                thought: body.trim().to_string(),
            },
            _ => unreachable!("tag list and match arms are kept in sync"),
        };

        // Text before a tag is the reasoning behind it.
        let has_own_text = match &action {
            Action::Message { .. } => true,
            Action::Finish { thought, .. } | Action::Reject { thought, .. } => !thought.is_empty(),
            _ => false,
        };
        if leading.is_empty() || has_own_text {
            actions.push(action);
        } else {
            actions.push(action.with_thought(leading));
        }
    }

    Ok(if actions.is_empty() { None } else { Some(actions) })
}

fn strip_fences(content: &str) -> &str {
    if content.contains("```json") {
        content
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .unwrap_or(content)
    } else if content.contains("```") {
        content
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .unwrap_or(content)
    } else {
        content.trim()
    }
}

fn action_from_value(mut value: serde_json::Value, raw: &str) -> Result<Action> {
    if let Some(obj) = value.as_object_mut() {
        if !obj.contains_key("action") {
            return Err(error::action_parse("JSON object has no 'action' field", raw));
        }
        obj.entry("args").or_insert_with(|| serde_json::json!({}));
    }
    serde_json::from_value(value)
        .map_err(|e| error::action_parse(format!("malformed action: {}", e), raw))
}

fn parse_json(text: &str) -> Result<Vec<Action>> {
    let json_str = strip_fences(text);
    let value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|_| error::action_parse("no action tag or JSON action found", text))?;

    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| action_from_value(item, text))
            .collect(),
        other @ serde_json::Value::Object(_) => Ok(vec![action_from_value(other, text)?]),
        _ => Err(error::action_parse("JSON completion is not an action", text)),
    }
}
