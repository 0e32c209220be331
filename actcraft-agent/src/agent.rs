//! Agent implementation - the reduce -> generate -> emit loop

use actcraft_core::config::RetryConfig;
use actcraft_core::prompt::parse_correction;
use actcraft_core::{
    Action, AgentConfig, Context, Error, ErrorKind, Event, EventLog, EventPayload, EventSource,
    HistoryReducer, LlmProvider, Program, ProgramModule, ProgramStore, ProgramSubscription,
    Result, Storage, TaskDescriptor,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// User message that ends a session without consulting the model
const EXIT_COMMAND: &str = "/exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Reducing,
    Generating,
    Emitting,
    Terminated,
    Failed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Reducing => "reducing",
            AgentState::Generating => "generating",
            AgentState::Emitting => "emitting",
            AgentState::Terminated => "terminated",
            AgentState::Failed => "failed",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Journal record written by [`Agent::save_history`]
#[derive(Serialize)]
struct SessionRecord<'a> {
    history: &'a [Event],
    pending: &'a VecDeque<Action>,
}

/// A journal record as read back
#[derive(Debug, Deserialize)]
pub(crate) struct SavedSession {
    pub history: Vec<Event>,
    #[serde(default)]
    pub pending: VecDeque<Action>,
}

/// A single coding agent bound to one provider
pub struct Agent<P: LlmProvider> {
    config: AgentConfig,
    provider: P,
    reducer: HistoryReducer,
    history: EventLog,
    default_program: Arc<Program>,
    /// Exactly one program is active; replaced wholesale between steps
    active: Arc<Program>,
    subscription: Option<ProgramSubscription>,
    store: Option<ProgramStore>,
    journal: Option<Storage>,
    /// Extra actions from a multi-action completion, emitted on later steps
    pending: VecDeque<Action>,
    state: AgentState,
}

impl<P: LlmProvider> Agent<P> {
    pub fn new(config: AgentConfig, provider: P) -> Self {
        let default_program = Arc::new(Program::instruction("default", config.instruction.clone()));
        Self {
            reducer: HistoryReducer::new(config.reducer.policy),
            config,
            provider,
            history: EventLog::new(),
            active: Arc::clone(&default_program),
            default_program,
            subscription: None,
            store: None,
            journal: None,
            pending: VecDeque::new(),
            state: AgentState::Idle,
        }
    }

    /// Start from a specific program instead of the default one
    pub fn with_program(mut self, program: Program) -> Self {
        self.active = Arc::new(program);
        self
    }

    /// Persist adopted programs
    pub fn with_store(mut self, store: ProgramStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Persist history under the agent id
    pub fn with_journal(mut self, journal: Storage) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Pick up programs published by an optimizer
    pub fn with_subscription(mut self, subscription: ProgramSubscription) -> Self {
        self.subscription = Some(subscription);
        self
    }

    /// Resume from a recorded history. A log ending in a terminal action
    /// leaves the agent terminated.
    pub fn with_history(mut self, history: EventLog) -> Self {
        let ended = matches!(
            history.last(),
            Some(event) if event.source == EventSource::Agent
                && event.action().is_some_and(Action::is_terminal)
        );
        self.history = history;
        if ended {
            self.pending.clear();
            self.state = AgentState::Terminated;
        }
        self
    }

    /// Actions left over from a multi-action completion, emitted before the
    /// model is consulted again
    pub fn with_pending(mut self, pending: impl IntoIterator<Item = Action>) -> Self {
        if self.state != AgentState::Terminated {
            self.pending = pending.into_iter().collect();
        }
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn history(&self) -> &EventLog {
        &self.history
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.active
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    // =========================================================================
    // Executor / user boundary
    // =========================================================================

    /// Record an observation or user message. A failed agent becomes idle again.
    pub fn observe(&mut self, source: EventSource, payload: EventPayload) -> u64 {
        let seq = self.history.append(source, payload);
        if self.state == AgentState::Failed {
            self.state = AgentState::Idle;
        }
        tracing::debug!(seq, source = %source, "recorded event");
        seq
    }

    /// Produce the next action for `task`
    pub async fn step(&mut self, task: &TaskDescriptor) -> Result<Action> {
        match self.state {
            AgentState::Terminated => {
                return Err(Error::new(
                    ErrorKind::AgentTerminated,
                    "agent already emitted a terminal action; reset it to start over",
                )
                .with_operation("agent::step"));
            }
            AgentState::Failed => self.state = AgentState::Idle,
            _ => {}
        }
        task.validate().map_err(|e| e.with_operation("agent::step"))?;

        self.refresh_program();

        if let Some(action) = self.pending.pop_front() {
            tracing::debug!(remaining = self.pending.len(), "emitting queued action");
            return Ok(self.emit(action));
        }

        if self.exit_requested() {
            return Ok(self.emit(Action::finish().with_thought("user requested exit")));
        }

        self.state = AgentState::Reducing;
        let program = Arc::clone(&self.active);
        let ctx = self.reducer.reduce(self.history.as_slice(), self.config.reducer.budget());
        if ctx.is_truncated() {
            tracing::warn!(
                budget = ctx.budget.limit,
                "most recent event exceeds the history budget; truncated"
            );
        }

        self.state = AgentState::Generating;
        let generated = generate(&self.provider, &self.config.retry, &program, ctx, task).await;

        match generated {
            Ok(mut actions) => {
                let first = actions.remove(0);
                self.pending.extend(actions);
                Ok(self.emit(first))
            }
            Err(e) => {
                self.state = AgentState::Failed;
                tracing::error!(error = %e, "step failed");
                Err(e)
            }
        }
    }

    /// Like [`Agent::step`], abandoned as soon as `cancel` completes.
    ///
    /// A cancelled step records nothing and leaves the agent idle.
    pub async fn step_with_cancel<F>(&mut self, task: &TaskDescriptor, cancel: F) -> Result<Action>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            result = self.step(task) => Some(result),
            _ = cancel => None,
        };

        match outcome {
            Some(result) => result,
            None => {
                self.state = AgentState::Idle;
                tracing::info!("step cancelled");
                Err(Error::cancelled("agent::step"))
            }
        }
    }

    // =========================================================================
    // Program management
    // =========================================================================

    /// Switch to `program` and persist the selection
    pub fn adopt(&mut self, program: Program) -> Result<()> {
        if let Some(store) = &mut self.store {
            store.save(&self.config.agent_id, &program)?;
        }
        tracing::info!(
            program = %program.name(),
            version = program.version(),
            strategy = program.strategy(),
            "adopted program"
        );
        self.active = Arc::new(program);
        Ok(())
    }

    /// Clear history, queued actions and the persisted selection
    pub fn reset(&mut self) -> Result<()> {
        self.history.clear();
        self.pending.clear();
        self.state = AgentState::Idle;
        self.active = Arc::clone(&self.default_program);
        if let Some(store) = &mut self.store {
            store.remove(&self.config.agent_id)?;
        }
        if let Some(journal) = &mut self.journal {
            journal.delete(&self.config.agent_id)?;
        }
        tracing::info!(agent_id = %self.config.agent_id, "agent reset");
        Ok(())
    }

    /// Write the history and queued actions to the journal, if one is attached
    pub fn save_history(&mut self) -> Result<()> {
        if let Some(journal) = &mut self.journal {
            let record = SessionRecord {
                history: self.history.as_slice(),
                pending: &self.pending,
            };
            journal
                .set_typed(&self.config.agent_id, &record)
                .map_err(|e| e.with_operation("agent::save_history"))?;
        }
        Ok(())
    }

    fn refresh_program(&mut self) {
        let Some(program) = self.subscription.as_mut().and_then(|s| s.take_update()) else {
            return;
        };
        if let Some(store) = &mut self.store {
            if let Err(e) = store.save(&self.config.agent_id, &program) {
                tracing::warn!(error = %e, "failed to persist published program");
            }
        }
        tracing::info!(
            program = %program.name(),
            version = program.version(),
            "switched to published program"
        );
        self.active = program;
    }

    fn exit_requested(&self) -> bool {
        matches!(
            self.history.last(),
            Some(event) if event.source == EventSource::User
                && matches!(&event.payload, EventPayload::Message { content } if content.trim() == EXIT_COMMAND)
        )
    }

    fn emit(&mut self, action: Action) -> Action {
        self.state = AgentState::Emitting;
        let seq = self
            .history
            .append(EventSource::Agent, EventPayload::Action(action.clone()));

        self.state = if action.is_terminal() {
            self.pending.clear();
            AgentState::Terminated
        } else {
            AgentState::Idle
        };
        tracing::info!(seq, action = %action.kind(), state = %self.state, "emitted action");
        action
    }
}

/// Run the program, re-prompting on parse failures and backing off on
/// transient provider failures.
async fn generate<P: LlmProvider>(
    provider: &P,
    retry: &RetryConfig,
    program: &Program,
    mut ctx: Context<'_>,
    task: &TaskDescriptor,
) -> Result<Vec<Action>> {
    let mut attempts = 0u32;
    let mut parse_retries = 0u32;
    let mut provider_retries = 0u32;

    loop {
        attempts += 1;
        let err = match program.run_many(&ctx, task, provider).await {
            Ok(actions) => return Ok(actions),
            Err(e) => e,
        };

        if err.kind() == ErrorKind::ActionParseFailed {
            if parse_retries >= retry.max_parse_retries {
                return Err(exhausted(err, attempts));
            }
            parse_retries += 1;
            tracing::warn!(attempt = attempts, error = %err, "no valid action in completion; re-prompting");
            ctx.corrections.push(parse_correction(err.message()));
        } else if err.is_retryable() {
            if provider_retries >= retry.max_provider_retries {
                return Err(exhausted(err.persist(), attempts));
            }
            provider_retries += 1;
            let delay = retry.backoff(provider_retries);
            tracing::warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "provider call failed; backing off"
            );
            tokio::time::sleep(delay).await;
        } else {
            return Err(exhausted(err, attempts));
        }
    }
}

fn exhausted(cause: Error, attempts: u32) -> Error {
    Error::agent_step(format!("no action after {} attempt(s): {}", attempts, cause.message()))
        .with_operation("agent::step")
        .with_context("attempts", attempts.to_string())
        .with_context("cause", cause.kind().to_string())
        .set_source(cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actcraft_core::{
        ActionKind, ChatMessage, CompletionRequest, CompletionResponse, Observation,
        ProgramPublisher, ProviderError, ScriptedProvider,
    };

    fn test_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.retry.backoff_base_ms = 0;
        config.retry.backoff_max_ms = 0;
        config
    }

    fn task() -> TaskDescriptor {
        TaskDescriptor::start("make the tests pass")
    }

    #[tokio::test]
    async fn test_step_from_empty_history() {
        let provider = ScriptedProvider::new(["<execute_bash>cargo test</execute_bash>"]);
        let mut agent = Agent::new(test_config(), provider);

        let action = agent.step(&task()).await.unwrap();

        assert_eq!(action, Action::run("cargo test"));
        assert_eq!(agent.state(), AgentState::Idle);
        assert_eq!(agent.history().len(), 1);
        assert_eq!(agent.history().get(0).unwrap().source, EventSource::Agent);
    }

    #[tokio::test]
    async fn test_malformed_output_exhausts_retries() {
        let provider = ScriptedProvider::repeating("I'm not sure what to do here.");
        let mut agent = Agent::new(test_config(), provider);

        let err = agent.step(&task()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AgentStepFailed);
        assert_eq!(err.context_value("attempts"), Some("3"));
        assert_eq!(err.source_error().map(|e| e.kind()), Some(ErrorKind::ActionParseFailed));
        assert_eq!(agent.state(), AgentState::Failed);
        assert_eq!(agent.provider().calls(), 3);
        assert!(agent.history().is_empty());
    }

    #[tokio::test]
    async fn test_parse_retry_adds_correction() {
        let provider = ScriptedProvider::new(["hmm", "<read_file>README.md</read_file>"]);
        let mut agent = Agent::new(test_config(), provider);

        let action = agent.step(&task()).await.unwrap();
        assert_eq!(action.kind(), ActionKind::Read);

        let requests = agent.provider().requests();
        assert_eq!(requests.len(), 2);
        let last = requests[1].messages.last().unwrap();
        assert!(last.content.contains("could not be parsed"));
    }

    #[tokio::test]
    async fn test_provider_backoff_then_success() {
        let provider = ScriptedProvider::new(Vec::<String>::new())
            .then_fail(ProviderError::Timeout)
            .then_fail(ProviderError::RateLimited { retry_after: None })
            .then("<execute_bash>ls</execute_bash>");
        let mut agent = Agent::new(test_config(), provider);

        let action = agent.step(&task()).await.unwrap();
        assert_eq!(action, Action::run("ls"));
        assert_eq!(agent.provider().calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_provider_failure_is_not_retried() {
        let provider = ScriptedProvider::new(Vec::<String>::new()).then_fail(ProviderError::AuthenticationFailed);
        let mut agent = Agent::new(test_config(), provider);

        let err = agent.step(&task()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentStepFailed);
        assert_eq!(agent.provider().calls(), 1);
        assert_eq!(agent.state(), AgentState::Failed);
    }

    #[tokio::test]
    async fn test_failed_agent_recovers() {
        let provider = ScriptedProvider::new(["nonsense", "nonsense", "nonsense"]).then("<finish>ok</finish>");
        let mut agent = Agent::new(test_config(), provider);

        assert!(agent.step(&task()).await.is_err());
        agent.observe(EventSource::User, EventPayload::message("try again"));
        assert_eq!(agent.state(), AgentState::Idle);

        let action = agent.step(&task()).await.unwrap();
        assert!(action.is_terminal());
        assert_eq!(agent.state(), AgentState::Terminated);
    }

    #[tokio::test]
    async fn test_invalid_task_fails_fast() {
        let provider = ScriptedProvider::repeating("<finish></finish>");
        let mut agent = Agent::new(test_config(), provider);

        let err = agent.step(&TaskDescriptor::start("  ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskInvalid);
        assert_eq!(agent.state(), AgentState::Idle);
        assert_eq!(agent.provider().calls(), 0);
    }

    #[tokio::test]
    async fn test_terminated_agent_refuses_steps() {
        let provider = ScriptedProvider::repeating("<finish>done</finish>");
        let mut agent = Agent::new(test_config(), provider);

        agent.step(&task()).await.unwrap();
        let err = agent.step(&task()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentTerminated);

        agent.reset().unwrap();
        assert_eq!(agent.state(), AgentState::Idle);
        assert!(agent.history().is_empty());
    }

    #[tokio::test]
    async fn test_exit_message_finishes_without_model() {
        let provider = ScriptedProvider::repeating("<execute_bash>ls</execute_bash>");
        let mut agent = Agent::new(test_config(), provider);

        agent.observe(EventSource::User, EventPayload::message("/exit"));
        let action = agent.step(&task()).await.unwrap();

        assert_eq!(action.kind(), ActionKind::Finish);
        assert_eq!(agent.provider().calls(), 0);
    }

    #[tokio::test]
    async fn test_multi_action_completion_is_queued() {
        let provider = ScriptedProvider::new([
            "<execute_bash>mkdir out</execute_bash>\n<execute_bash>touch out/a</execute_bash>",
        ]);
        let mut agent = Agent::new(test_config(), provider);

        assert_eq!(agent.step(&task()).await.unwrap(), Action::run("mkdir out"));
        assert_eq!(agent.pending(), 1);
        agent.observe(EventSource::Environment, EventPayload::Observation(Observation::new("").with_exit_code(0)));
        assert_eq!(agent.step(&task()).await.unwrap(), Action::run("touch out/a"));
        assert_eq!(agent.provider().calls(), 1);
    }

    #[tokio::test]
    async fn test_budget_bounds_prompt_history() {
        let mut config = test_config();
        config.reducer.budget = 5;
        let provider = ScriptedProvider::repeating("<finish></finish>");
        let mut agent = Agent::new(config, provider);

        for i in 0..100 {
            agent.observe(EventSource::User, EventPayload::message(format!("note {}", i)));
        }
        agent.step(&task()).await.unwrap();

        let request = &agent.provider().requests()[0];
        let user_text: String = request.messages.iter().map(|m| m.content.clone()).collect();
        assert!(user_text.contains("note 95"));
        assert!(user_text.contains("note 99"));
        assert!(!user_text.contains("note 94"));
    }

    #[tokio::test]
    async fn test_cancel_leaves_agent_idle() {
        struct Stalled;

        impl LlmProvider for Stalled {
            fn name(&self) -> &str {
                "stalled"
            }

            fn default_model(&self) -> &str {
                "stalled"
            }

            async fn complete(&self, _request: CompletionRequest) -> std::result::Result<CompletionResponse, ProviderError> {
                std::future::pending().await
            }
        }

        let mut agent = Agent::new(test_config(), Stalled);
        agent.observe(EventSource::User, EventPayload::message("start"));

        let cancel = tokio::time::sleep(std::time::Duration::from_millis(10));
        let err = agent.step_with_cancel(&task(), cancel).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(agent.state(), AgentState::Idle);
        assert_eq!(agent.history().len(), 1);
    }

    /// Publishes a new program while a completion is in flight
    struct PublishingProvider {
        inner: ScriptedProvider,
        publisher: ProgramPublisher,
    }

    impl LlmProvider for PublishingProvider {
        fn name(&self) -> &str {
            "publishing"
        }

        fn default_model(&self) -> &str {
            "publishing"
        }

        async fn complete(&self, request: CompletionRequest) -> std::result::Result<CompletionResponse, ProviderError> {
            self.publisher.publish(Program::instruction("v2", "SECOND INSTRUCTION"));
            self.inner.complete(request).await
        }
    }

    fn system_prompt(messages: &[ChatMessage]) -> &str {
        &messages[0].content
    }

    #[tokio::test]
    async fn test_program_switch_waits_for_next_step() {
        let publisher = ProgramPublisher::new(Program::default());
        let provider = PublishingProvider {
            inner: ScriptedProvider::repeating("<execute_bash>ls</execute_bash>"),
            publisher: publisher.clone(),
        };
        let mut agent = Agent::new(test_config(), provider).with_subscription(publisher.subscribe());

        agent.step(&task()).await.unwrap();
        assert_eq!(agent.program().name(), "default");

        agent.step(&task()).await.unwrap();
        assert_eq!(agent.program().name(), "v2");

        let requests = agent.provider().inner.requests();
        assert!(!system_prompt(&requests[0].messages).contains("SECOND INSTRUCTION"));
        assert!(system_prompt(&requests[1].messages).contains("SECOND INSTRUCTION"));
    }

    #[tokio::test]
    async fn test_history_ending_in_finish_resumes_terminated() {
        let mut log = EventLog::new();
        log.append(EventSource::User, EventPayload::message("tidy up"));
        log.append(EventSource::Agent, EventPayload::Action(Action::finish().with_thought("done")));

        let provider = ScriptedProvider::repeating("<execute_bash>ls</execute_bash>");
        let mut agent = Agent::new(test_config(), provider)
            .with_history(log)
            .with_pending([Action::run("ls")]);

        assert_eq!(agent.state(), AgentState::Terminated);
        assert_eq!(agent.pending(), 0);
        let err = agent.step(&task()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentTerminated);
        assert_eq!(agent.provider().calls(), 0);
    }

    #[tokio::test]
    async fn test_adopt_persists_and_reset_restores_default() {
        let provider = ScriptedProvider::repeating("<finish></finish>");
        let mut agent = Agent::new(test_config(), provider).with_store(ProgramStore::memory());

        agent.adopt(Program::instruction("tuned", "be precise")).unwrap();
        assert_eq!(agent.program().name(), "tuned");

        agent.reset().unwrap();
        assert_eq!(agent.program().name(), "default");
    }
}
