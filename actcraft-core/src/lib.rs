//! # actcraft core
//!
//! Building blocks of an optimizable coding agent.
//!
//! ## Core Concepts
//! - **Events**: immutable records of each turn, kept in an append-only log
//! - **Reducer**: bounds the log to a context the model can take in
//! - **Programs**: versioned prompting strategies that map context to an action
//! - **Optimizer**: offline selection among candidate programs on scored examples
//! - **Provider**: the narrow text-completion boundary (`chat(messages) -> text`)

pub mod action;
pub mod config;
pub mod error;
pub mod event;
pub mod example;
pub mod optimizer;
pub mod program;
pub mod prompt;
pub mod provider;
pub mod publish;
pub mod reducer;
pub mod storage;
pub mod task;

pub use action::{parse_action, parse_actions, Action, ActionKind};
pub use config::{AgentConfig, OptimizerSettings, ProviderSettings, ReducerConfig, RetryConfig};
pub use error::{Error, ErrorKind, ErrorStatus, Result};
pub use event::{BudgetUnit, Event, EventKind, EventLog, EventPayload, EventSource, Observation};
pub use example::{load_examples, Expectation, ScoredExample};
pub use optimizer::{
    CandidateScore, ExactMatch, ExpectationMetric, Metric, OptimizationReport, Optimizer,
    OptimizerConfig,
};
pub use program::{
    CompileOptions, Demonstration, FewShotProgram, InstructionProgram, Program, ProgramMeta,
    ProgramModule,
};
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, HttpProvider, LlmProvider,
    ProviderConfig, ProviderError, Role, ScriptedProvider, Usage,
};
pub use publish::{ProgramPublisher, ProgramSubscription};
pub use reducer::{Budget, Context, HistoryReducer, OverflowPolicy, Summary};
pub use storage::{FileStorage, MemoryStorage, ProgramStore, Storage, StorageBackend};
pub use task::TaskDescriptor;
