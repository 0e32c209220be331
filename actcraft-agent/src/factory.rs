//! Explicit agent construction from configuration

use crate::agent::{Agent, SavedSession};
use actcraft_core::{AgentConfig, EventLog, LlmProvider, ProgramStore, Result, Storage};
use std::collections::VecDeque;

/// Build an agent with file persistence under `config.storage_dir`.
///
/// A previously adopted program, the saved history and any queued actions
/// are restored.
pub fn build_agent<P: LlmProvider>(config: AgentConfig, provider: P) -> Result<Agent<P>> {
    config.validate()?;

    let store = ProgramStore::file(&config.storage_dir)?;
    let persisted = store.load(&config.agent_id)?;

    let journal = Storage::file(&config.storage_dir)?.with_namespace("history");
    let (history, pending) = match journal.get_typed::<SavedSession>(&config.agent_id)? {
        Some(session) => (EventLog::from_events(session.history)?, session.pending),
        None => (EventLog::new(), VecDeque::new()),
    };

    tracing::info!(
        agent_id = %config.agent_id,
        storage = %config.storage_dir.display(),
        restored_program = persisted.is_some(),
        events = history.len(),
        queued = pending.len(),
        "built agent"
    );

    let mut agent = Agent::new(config, provider)
        .with_store(store)
        .with_journal(journal)
        .with_history(history)
        .with_pending(pending);
    if let Some(program) = persisted {
        agent = agent.with_program(program);
    }
    Ok(agent)
}
