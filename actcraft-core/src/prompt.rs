//! Prompt rendering
//!
//! Pure functions turning (instruction, demonstrations, context, task) into
//! chat messages. Nothing here talks to a provider.

use crate::event::{estimate_tokens, Event, EventPayload, EventSource};
use crate::program::Demonstration;
use crate::provider::{ChatMessage, Role};
use crate::reducer::Context;
use crate::task::TaskDescriptor;

/// How completions must express actions
pub const ACTION_GUIDE: &str = "\
Respond with exactly one action, optionally preceded by a short thought.
Available actions:
<execute_bash>COMMAND</execute_bash> - run a shell command
<read_file>PATH</read_file> - read a file
<write_file path=\"PATH\">CONTENT</write_file> - write a whole file
<execute_browse>URL</execute_browse> - open a web page
<message>TEXT</message> - talk to the user
<finish>SUMMARY</finish> - the task is complete
<reject>REASON</reject> - the task cannot be completed
To edit part of a file reply with JSON instead:
{\"action\": \"edit\", \"args\": {\"path\": \"PATH\", \"old_str\": \"OLD\", \"new_str\": \"NEW\"}}";

/// Correction sent after a completion that held no usable action
pub fn parse_correction(reason: &str) -> String {
    format!(
        "Your previous reply could not be parsed ({}). Reply again with exactly one action in the required format.",
        reason
    )
}

fn event_message(event: &Event) -> ChatMessage {
    match (&event.payload, event.source) {
        (EventPayload::Observation(_), _) => ChatMessage::user(event.render()),
        (_, EventSource::Agent) => ChatMessage::assistant(event.render()),
        _ => ChatMessage::user(event.render()),
    }
}

/// Plain-text transcript of events, used to embed history in demonstrations
pub fn render_transcript<'a>(events: impl IntoIterator<Item = &'a Event>) -> String {
    events
        .into_iter()
        .map(|event| {
            let message = event_message(event);
            format!("[{}] {}", event.source, message.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn push_merged(messages: &mut Vec<ChatMessage>, message: ChatMessage) {
    match messages.last_mut() {
        Some(last) if last.role == message.role && last.role != Role::System => {
            last.content.push_str("\n\n");
            last.content.push_str(&message.content);
        }
        _ => messages.push(message),
    }
}

/// Build the full message list for one generation
pub fn render_messages(
    instruction: &str,
    demos: &[Demonstration],
    ctx: &Context<'_>,
    task: &TaskDescriptor,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(format!("{}\n\n{}", instruction.trim(), ACTION_GUIDE))];

    for demo in demos {
        let mut user = format!("TASK: {}", demo.task);
        if !demo.context.is_empty() {
            user.push_str("\n\n");
            user.push_str(&demo.context);
        }
        push_merged(&mut messages, ChatMessage::user(user));
        push_merged(&mut messages, ChatMessage::assistant(demo.action.to_tagged()));
    }

    push_merged(&mut messages, ChatMessage::user(format!("TASK: {}", task.instruction)));

    if let Some(summary) = &ctx.summary {
        push_merged(&mut messages, ChatMessage::user(summary.render()));
    }

    for event in ctx.window {
        push_merged(&mut messages, event_message(event));
    }
    if let Some(event) = &ctx.truncated {
        push_merged(&mut messages, event_message(event));
    }

    for correction in &ctx.corrections {
        push_merged(&mut messages, ChatMessage::user(correction.clone()));
    }

    tracing::debug!(
        messages = messages.len(),
        approx_tokens = messages.iter().map(|m| estimate_tokens(&m.content)).sum::<usize>(),
        "rendered prompt"
    );
    messages
}
