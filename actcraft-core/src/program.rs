//! # Program Module
//!
//! A program is an immutable, versioned prompting strategy that maps a
//! bounded context and a task to the next action. Programs are produced by
//! compiling against scored examples and swapped wholesale, never mutated.
//!
//! ## Strategies
//! - `instruction`: zero-shot, system instruction only
//! - `few_shot`: instruction plus demonstrations selected at compile time

use crate::action::{parse_actions, Action};
use crate::error::{self, Error, Result};
use crate::event::current_timestamp;
use crate::example::ScoredExample;
use crate::prompt::{render_messages, render_transcript};
use crate::provider::{ChatMessage, LlmProvider};
use crate::reducer::{Budget, Context, HistoryReducer};
use crate::task::TaskDescriptor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Instruction used when no program has been compiled yet
pub const DEFAULT_INSTRUCTION: &str = "You are a careful software engineering agent working in a \
terminal. Take one small, verifiable step at a time and finish once the task is done.";

/// Identity and lineage of a compiled artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramMeta {
    pub name: String,
    pub version: u32,
    /// Optimization round that produced this artifact
    pub generation: u64,
    /// Examples embedded in the artifact as demonstrations
    pub compiled_examples: usize,
    /// sha256 of the strategy content
    pub fingerprint: String,
    pub created_at: u64,
}

/// A worked example shown to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demonstration {
    pub task: String,
    #[serde(default)]
    pub context: String,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionProgram {
    pub meta: ProgramMeta,
    pub instruction: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShotProgram {
    pub meta: ProgramMeta,
    pub instruction: String,
    pub demos: Vec<Demonstration>,
}

/// Serialized program artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Program {
    Instruction(InstructionProgram),
    FewShot(FewShotProgram),
}

/// Knobs for demonstration selection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompileOptions {
    pub max_demos: usize,
    /// Examples scored below this are never shown
    pub min_score: Option<f64>,
    pub seed: u64,
    /// Stamped on the produced artifact
    pub generation: u64,
    /// Budget for the history embedded in each demonstration
    pub demo_budget: Budget,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            max_demos: 4,
            min_score: None,
            seed: 0,
            generation: 1,
            demo_budget: Budget::items(6),
        }
    }
}

/// The run/compile capability shared by every strategy
#[allow(async_fn_in_trait)]
pub trait ProgramModule {
    fn meta(&self) -> &ProgramMeta;

    /// Render the messages sent to the provider
    fn prompt(&self, ctx: &Context<'_>, task: &TaskDescriptor) -> Vec<ChatMessage>;

    /// Produce a new artifact from labeled examples
    fn compile(&self, examples: &[ScoredExample], options: &CompileOptions) -> Result<Program>;

    /// Generate every action contained in one completion
    async fn run_many<P: LlmProvider>(
        &self,
        ctx: &Context<'_>,
        task: &TaskDescriptor,
        provider: &P,
    ) -> Result<Vec<Action>> {
        let messages = self.prompt(ctx, task);
        let text = provider
            .chat(messages)
            .await
            .map_err(error::provider_error)?;
        parse_actions(&text).map_err(|e| e.with_operation("program::run"))
    }

    /// Generate the next action
    async fn run<P: LlmProvider>(
        &self,
        ctx: &Context<'_>,
        task: &TaskDescriptor,
        provider: &P,
    ) -> Result<Action> {
        let mut actions = self.run_many(ctx, task, provider).await?;
        Ok(actions.swap_remove(0))
    }
}

fn fingerprint(strategy: &str, instruction: &str, demos: &[Demonstration]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(strategy.as_bytes());
    hasher.update([0]);
    hasher.update(instruction.as_bytes());
    hasher.update([0]);
    hasher.update(serde_json::to_vec(demos).unwrap_or_default());
    hex::encode(hasher.finalize())
}

/// Seeded tie-break key for an example
fn selection_key(seed: u64, index: usize, id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update((index as u64).to_le_bytes());
    hasher.update(id.as_bytes());
    hasher.finalize().into()
}

fn compile_few_shot(
    source: &ProgramMeta,
    instruction: &str,
    examples: &[ScoredExample],
    options: &CompileOptions,
) -> Result<Program> {
    if examples.is_empty() {
        return Err(Error::empty_examples().with_operation("program::compile"));
    }

    let mut eligible: Vec<(usize, &ScoredExample, &Action)> = examples
        .iter()
        .enumerate()
        .filter_map(|(i, ex)| ex.demo_action().map(|action| (i, ex, action)))
        .filter(|(_, ex, _)| match (options.min_score, ex.score) {
            (Some(min), Some(score)) => score >= min,
            _ => true,
        })
        .collect();

    if eligible.is_empty() {
        return Err(error::compile_failed(
            &source.name,
            "no example carries an exact expected action above the score threshold",
        )
        .with_context("examples", examples.len().to_string()));
    }

    eligible.sort_by(|(ia, a, _), (ib, b, _)| {
        let (sa, sb) = (a.score.unwrap_or(f64::NEG_INFINITY), b.score.unwrap_or(f64::NEG_INFINITY));
        sb.total_cmp(&sa).then_with(|| {
            selection_key(options.seed, *ia, &a.id).cmp(&selection_key(options.seed, *ib, &b.id))
        })
    });

    let reducer = HistoryReducer::default();
    let demos: Vec<Demonstration> = eligible
        .into_iter()
        .take(options.max_demos)
        .map(|(_, ex, action)| Demonstration {
            task: ex.task.instruction.clone(),
            context: render_transcript(reducer.reduce(&ex.history, options.demo_budget).events()),
            action: action.clone(),
        })
        .collect();

    let meta = ProgramMeta {
        name: source.name.clone(),
        version: source.version + 1,
        generation: options.generation,
        compiled_examples: demos.len(),
        fingerprint: fingerprint("few_shot", instruction, &demos),
        created_at: current_timestamp(),
    };

    tracing::debug!(
        program = %meta.name,
        version = meta.version,
        demos = demos.len(),
        "compiled few-shot program"
    );

    Ok(Program::FewShot(FewShotProgram {
        meta,
        instruction: instruction.to_string(),
        demos,
    }))
}

impl InstructionProgram {
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        let instruction = instruction.into();
        Self {
            meta: ProgramMeta {
                name: name.into(),
                version: 1,
                generation: 0,
                compiled_examples: 0,
                fingerprint: fingerprint("instruction", &instruction, &[]),
                created_at: current_timestamp(),
            },
            instruction,
        }
    }
}

impl ProgramModule for InstructionProgram {
    fn meta(&self) -> &ProgramMeta {
        &self.meta
    }

    fn prompt(&self, ctx: &Context<'_>, task: &TaskDescriptor) -> Vec<ChatMessage> {
        render_messages(&self.instruction, &[], ctx, task)
    }

    fn compile(&self, examples: &[ScoredExample], options: &CompileOptions) -> Result<Program> {
        compile_few_shot(&self.meta, &self.instruction, examples, options)
    }
}

impl ProgramModule for FewShotProgram {
    fn meta(&self) -> &ProgramMeta {
        &self.meta
    }

    fn prompt(&self, ctx: &Context<'_>, task: &TaskDescriptor) -> Vec<ChatMessage> {
        render_messages(&self.instruction, &self.demos, ctx, task)
    }

    fn compile(&self, examples: &[ScoredExample], options: &CompileOptions) -> Result<Program> {
        compile_few_shot(&self.meta, &self.instruction, examples, options)
    }
}

impl ProgramModule for Program {
    fn meta(&self) -> &ProgramMeta {
        match self {
            Program::Instruction(p) => p.meta(),
            Program::FewShot(p) => p.meta(),
        }
    }

    fn prompt(&self, ctx: &Context<'_>, task: &TaskDescriptor) -> Vec<ChatMessage> {
        match self {
            Program::Instruction(p) => p.prompt(ctx, task),
            Program::FewShot(p) => p.prompt(ctx, task),
        }
    }

    fn compile(&self, examples: &[ScoredExample], options: &CompileOptions) -> Result<Program> {
        match self {
            Program::Instruction(p) => p.compile(examples, options),
            Program::FewShot(p) => p.compile(examples, options),
        }
    }
}

impl Program {
    /// Zero-shot program with the given instruction
    pub fn instruction(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Program::Instruction(InstructionProgram::new(name, instruction))
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            Program::Instruction(_) => "instruction",
            Program::FewShot(_) => "few_shot",
        }
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    pub fn version(&self) -> u32 {
        self.meta().version
    }

    pub fn instruction_text(&self) -> &str {
        match self {
            Program::Instruction(p) => &p.instruction,
            Program::FewShot(p) => &p.instruction,
        }
    }

    pub fn demos(&self) -> &[Demonstration] {
        match self {
            Program::Instruction(_) => &[],
            Program::FewShot(p) => &p.demos,
        }
    }
}

impl Default for Program {
    fn default() -> Self {
        Program::instruction("default", DEFAULT_INSTRUCTION)
    }
}
