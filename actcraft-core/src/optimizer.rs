//! # Optimizer
//!
//! Offline search over candidate programs. Each candidate is run against
//! a (possibly subsampled) set of scored examples, scored by a [`Metric`],
//! and the best candidate is reported. Publishing the winner to agents is
//! a separate step; see [`crate::publish`].

use crate::action::Action;
use crate::error::{self, ErrorKind, Result};
use crate::example::{Expectation, ScoredExample};
use crate::program::{CompileOptions, Program, ProgramModule};
use crate::provider::LlmProvider;
use crate::reducer::{Budget, HistoryReducer, OverflowPolicy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Means closer than this are treated as equal
pub const SCORE_EPSILON: f64 = 1e-9;

/// Scores a predicted action against a labeled example
pub trait Metric {
    fn score(&self, predicted: &Action, example: &ScoredExample) -> f64;
}

impl<F> Metric for F
where
    F: Fn(&Action, &ScoredExample) -> f64,
{
    fn score(&self, predicted: &Action, example: &ScoredExample) -> f64 {
        self(predicted, example)
    }
}

/// 1.0 when the example's expectation is satisfied, else 0.0
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpectationMetric;

impl Metric for ExpectationMetric {
    fn score(&self, predicted: &Action, example: &ScoredExample) -> f64 {
        if example.expected.is_satisfied_by(predicted) {
            1.0
        } else {
            0.0
        }
    }
}

/// 1.0 only for an identical action, thought included
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl Metric for ExactMatch {
    fn score(&self, predicted: &Action, example: &ScoredExample) -> f64 {
        match &example.expected {
            Expectation::Action(expected) if expected == predicted => 1.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub seed: u64,
    /// Budget used to reduce each example's history
    pub budget: Budget,
    pub policy: OverflowPolicy,
    /// Evaluate on a seeded subsample of this size
    pub sample_size: Option<usize>,
    pub max_demos: usize,
    pub min_score: Option<f64>,
    /// One compiled candidate per entry
    pub demo_counts: Vec<usize>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            budget: Budget::items(20),
            policy: OverflowPolicy::DropOldest,
            sample_size: None,
            max_demos: 4,
            min_score: None,
            demo_counts: vec![2, 4],
        }
    }
}

/// Evaluation record for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub index: usize,
    pub name: String,
    pub version: u32,
    pub generation: u64,
    pub compiled_examples: usize,
    pub fingerprint: String,
    pub mean: f64,
    pub scores: Vec<f64>,
    pub parse_failures: usize,
}

/// Index of the winner: the candidates within [`SCORE_EPSILON`] of the top
/// mean form the tied group, which is then ranked by fewer compiled
/// examples, earlier generation and earlier position.
fn select_best(scores: &[CandidateScore]) -> usize {
    let top = scores.iter().map(|s| s.mean).fold(f64::NEG_INFINITY, f64::max);
    scores
        .iter()
        .filter(|s| top - s.mean <= SCORE_EPSILON)
        .min_by_key(|s| (s.compiled_examples, s.generation, s.index))
        .map_or(0, |s| s.index)
}

#[derive(Debug, Clone)]
pub struct OptimizationReport {
    pub best: Program,
    pub best_index: usize,
    pub scores: Vec<CandidateScore>,
}

impl OptimizationReport {
    pub fn best_score(&self) -> &CandidateScore {
        &self.scores[self.best_index]
    }
}

pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// The base program plus one compiled variant per distinct demo count.
    ///
    /// Counts are capped at `max_demos` and compiled smallest first, so a
    /// smaller artifact always carries the earlier generation.
    pub fn compile_candidates(&self, base: &Program, examples: &[ScoredExample]) -> Result<Vec<Program>> {
        let mut candidates = vec![base.clone()];
        let next_generation = base.meta().generation + 1;

        let mut counts: Vec<usize> = self
            .config
            .demo_counts
            .iter()
            .map(|&n| n.min(self.config.max_demos))
            .filter(|&n| n > 0)
            .collect();
        counts.sort_unstable();
        counts.dedup();

        for (i, &count) in counts.iter().enumerate() {
            let options = CompileOptions {
                max_demos: count,
                min_score: self.config.min_score,
                seed: self.config.seed,
                generation: next_generation + i as u64,
                demo_budget: self.config.budget,
            };
            candidates.push(base.compile(examples, &options)?);
        }

        Ok(candidates)
    }

    /// Seeded subsample, original order preserved
    fn evaluation_set<'a>(&self, examples: &'a [ScoredExample]) -> Vec<&'a ScoredExample> {
        match self.config.sample_size {
            Some(n) if n < examples.len() => {
                let mut keyed: Vec<(usize, [u8; 32])> = (0..examples.len())
                    .map(|i| {
                        let mut hasher = Sha256::new();
                        hasher.update(self.config.seed.to_le_bytes());
                        hasher.update((i as u64).to_le_bytes());
                        (i, hasher.finalize().into())
                    })
                    .collect();
                keyed.sort_by(|a, b| a.1.cmp(&b.1));
                let mut picked: Vec<usize> = keyed.into_iter().take(n).map(|(i, _)| i).collect();
                picked.sort_unstable();
                picked.into_iter().map(|i| &examples[i]).collect()
            }
            _ => examples.iter().collect(),
        }
    }

    /// Score every candidate and select the best one
    pub async fn optimize<P, M>(
        &self,
        candidates: Vec<Program>,
        examples: &[ScoredExample],
        metric: &M,
        provider: &P,
    ) -> Result<OptimizationReport>
    where
        P: LlmProvider,
        M: Metric + ?Sized,
    {
        if candidates.is_empty() {
            return Err(error::optimization_failed("no candidate programs to evaluate"));
        }
        let eval = self.evaluation_set(examples);
        if eval.is_empty() {
            return Err(error::optimization_failed("example set is empty"));
        }

        let reducer = HistoryReducer::new(self.config.policy);
        let mut scores = Vec::with_capacity(candidates.len());

        for (index, candidate) in candidates.iter().enumerate() {
            let meta = candidate.meta();
            let mut per_example = Vec::with_capacity(eval.len());
            let mut parse_failures = 0;

            for example in &eval {
                let ctx = reducer.reduce(&example.history, self.config.budget);
                let score = match candidate.run(&ctx, &example.task, provider).await {
                    Ok(action) => metric.score(&action, example),
                    Err(e) if e.kind() == ErrorKind::ActionParseFailed => {
                        parse_failures += 1;
                        0.0
                    }
                    Err(e) => {
                        return Err(error::optimization_failed(format!(
                            "candidate {} failed on example {}",
                            index, example.id
                        ))
                        .with_operation("optimizer::optimize")
                        .with_context("candidate", meta.name.clone())
                        .with_context("example", example.id.clone())
                        .set_source(e));
                    }
                };

                if !score.is_finite() {
                    return Err(error::optimization_failed(format!(
                        "metric returned {} for example {}",
                        score, example.id
                    ))
                    .with_operation("optimizer::optimize"));
                }
                per_example.push(score);
            }

            let mean = per_example.iter().sum::<f64>() / per_example.len() as f64;
            tracing::info!(
                candidate = index,
                program = %meta.name,
                version = meta.version,
                compiled_examples = meta.compiled_examples,
                mean,
                parse_failures,
                "evaluated candidate"
            );

            scores.push(CandidateScore {
                index,
                name: meta.name.clone(),
                version: meta.version,
                generation: meta.generation,
                compiled_examples: meta.compiled_examples,
                fingerprint: meta.fingerprint.clone(),
                mean,
                scores: per_example,
                parse_failures,
            });
        }

        let best_index = select_best(&scores);

        tracing::info!(
            best = best_index,
            mean = scores[best_index].mean,
            candidates = scores.len(),
            "optimization finished"
        );

        Ok(OptimizationReport {
            best: candidates[best_index].clone(),
            best_index,
            scores,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::program::{FewShotProgram, ProgramMeta};
    use crate::provider::{ProviderError, ScriptedProvider};
    use crate::task::TaskDescriptor;

    fn candidate(name: &str, compiled_examples: usize, generation: u64) -> Program {
        Program::FewShot(FewShotProgram {
            meta: ProgramMeta {
                name: name.into(),
                version: 2,
                generation,
                compiled_examples,
                fingerprint: name.into(),
                created_at: 0,
            },
            instruction: "sys".into(),
            demos: Vec::new(),
        })
    }

    fn terminal_examples(n: usize) -> Vec<ScoredExample> {
        (0..n)
            .map(|i| ScoredExample::new(i.to_string(), TaskDescriptor::start("wrap up"), Expectation::Terminal))
            .collect()
    }

    #[tokio::test]
    async fn test_tie_prefers_fewer_compiled_examples() {
        let provider = ScriptedProvider::repeating("<finish>done</finish>");
        let optimizer = Optimizer::new(OptimizerConfig::default());

        let report = optimizer
            .optimize(
                vec![candidate("large", 20, 1), candidate("small", 10, 1)],
                &terminal_examples(3),
                &ExpectationMetric,
                &provider,
            )
            .await
            .unwrap();

        assert_eq!(report.best.name(), "small");
        assert_eq!(report.best_index, 1);
        assert_eq!(report.scores[0].mean, report.scores[1].mean);
    }

    #[tokio::test]
    async fn test_tie_then_generation_then_position() {
        let provider = ScriptedProvider::repeating("<finish></finish>");
        let optimizer = Optimizer::new(OptimizerConfig::default());
        let examples = terminal_examples(1);

        let report = optimizer
            .optimize(
                vec![candidate("late", 5, 3), candidate("early", 5, 2), candidate("twin", 5, 2)],
                &examples,
                &ExpectationMetric,
                &provider,
            )
            .await
            .unwrap();
        assert_eq!(report.best.name(), "early");
    }

    #[tokio::test]
    async fn test_near_equal_means_form_one_tied_group() {
        // Each candidate answers with its own command; means step by less than the epsilon.
        let provider = ScriptedProvider::new([
            "<execute_bash>hi</execute_bash>",
            "<execute_bash>mid</execute_bash>",
            "<execute_bash>lo</execute_bash>",
        ]);
        let optimizer = Optimizer::new(OptimizerConfig::default());
        let graded = |action: &Action, _: &ScoredExample| match action.primary_text() {
            "hi" => 0.5 + 1.2e-9,
            "mid" => 0.5 + 0.6e-9,
            _ => 0.5,
        };

        let report = optimizer
            .optimize(
                vec![candidate("hi", 30, 1), candidate("mid", 20, 1), candidate("lo", 10, 1)],
                &terminal_examples(1),
                &graded,
                &provider,
            )
            .await
            .unwrap();

        // "lo" is more than the epsilon below the top mean, so it is not tied.
        assert_eq!(report.best.name(), "mid");
        assert_eq!(report.best_index, 1);
    }

    #[tokio::test]
    async fn test_parse_failures_score_zero() {
        let provider = ScriptedProvider::new(["no idea", "<finish></finish>"]);
        let optimizer = Optimizer::new(OptimizerConfig::default());

        let report = optimizer
            .optimize(vec![candidate("only", 0, 0)], &terminal_examples(2), &ExpectationMetric, &provider)
            .await
            .unwrap();

        let score = report.best_score();
        assert_eq!(score.scores, vec![0.0, 1.0]);
        assert_eq!(score.parse_failures, 1);
        assert!((score.mean - 0.5).abs() < SCORE_EPSILON);
    }

    #[tokio::test]
    async fn test_provider_failure_aborts() {
        let provider = ScriptedProvider::new(Vec::<String>::new()).then_fail(ProviderError::AuthenticationFailed);
        let optimizer = Optimizer::new(OptimizerConfig::default());

        let err = optimizer
            .optimize(vec![candidate("a", 0, 0)], &terminal_examples(1), &ExpectationMetric, &provider)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OptimizationFailed);
        assert_eq!(err.source_error().map(|e| e.kind()), Some(ErrorKind::AuthenticationFailed));
    }

    #[tokio::test]
    async fn test_empty_inputs_and_non_finite_scores() {
        let provider = ScriptedProvider::repeating("<finish></finish>");
        let optimizer = Optimizer::new(OptimizerConfig::default());

        let err = optimizer
            .optimize(vec![candidate("a", 0, 0)], &[], &ExpectationMetric, &provider)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OptimizationFailed);

        let err = optimizer
            .optimize(Vec::new(), &terminal_examples(1), &ExpectationMetric, &provider)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OptimizationFailed);

        let nan = |_: &Action, _: &ScoredExample| f64::NAN;
        let err = optimizer
            .optimize(vec![candidate("a", 0, 0)], &terminal_examples(1), &nan, &provider)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OptimizationFailed);
    }

    #[tokio::test]
    async fn test_closure_metric() {
        let provider = ScriptedProvider::repeating("<execute_bash>ls</execute_bash>");
        let optimizer = Optimizer::new(OptimizerConfig::default());
        let prefers_runs = |action: &Action, _: &ScoredExample| {
            if action.kind() == ActionKind::Run { 0.75 } else { 0.0 }
        };

        let report = optimizer
            .optimize(vec![candidate("a", 0, 0)], &terminal_examples(2), &prefers_runs, &provider)
            .await
            .unwrap();
        assert!((report.best_score().mean - 0.75).abs() < SCORE_EPSILON);
    }

    #[test]
    fn test_sampling_is_seeded() {
        let examples = terminal_examples(20);
        let config = OptimizerConfig {
            sample_size: Some(5),
            seed: 9,
            ..Default::default()
        };
        let a: Vec<_> = Optimizer::new(config.clone()).evaluation_set(&examples).iter().map(|e| e.id.clone()).collect();
        let b: Vec<_> = Optimizer::new(config).evaluation_set(&examples).iter().map(|e| e.id.clone()).collect();

        assert_eq!(a.len(), 5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_compile_candidates() {
        let examples: Vec<_> = (0..6)
            .map(|i| {
                ScoredExample::new(
                    i.to_string(),
                    TaskDescriptor::start("greet"),
                    Expectation::Action(Action::run(format!("echo {}", i))),
                )
            })
            .collect();
        let optimizer = Optimizer::new(OptimizerConfig {
            demo_counts: vec![0, 1, 3],
            ..Default::default()
        });

        let candidates = optimizer.compile_candidates(&Program::default(), &examples).unwrap();
        let demo_counts: Vec<_> = candidates.iter().map(|p| p.demos().len()).collect();
        let generations: Vec<_> = candidates.iter().map(|p| p.meta().generation).collect();

        assert_eq!(demo_counts, vec![0, 1, 3]);
        assert_eq!(generations, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_smaller_artifact_wins_regardless_of_count_order() {
        let examples: Vec<_> = (0..6)
            .map(|i| {
                ScoredExample::new(
                    i.to_string(),
                    TaskDescriptor::start("wrap up"),
                    Expectation::Action(Action::finish()),
                )
            })
            .collect();
        let optimizer = Optimizer::new(OptimizerConfig {
            demo_counts: vec![4, 2, 9],
            ..Default::default()
        });

        let candidates = optimizer.compile_candidates(&Program::default(), &examples).unwrap();
        let demo_counts: Vec<_> = candidates.iter().map(|p| p.demos().len()).collect();
        let compiled: Vec<_> = candidates.iter().map(|p| p.meta().compiled_examples).collect();
        let generations: Vec<_> = candidates.iter().map(|p| p.meta().generation).collect();

        assert_eq!(demo_counts, vec![0, 2, 4]);
        assert_eq!(compiled, vec![0, 2, 4]);
        assert_eq!(generations, vec![0, 1, 2]);

        let provider = ScriptedProvider::repeating("<finish></finish>");
        let report = optimizer
            .optimize(candidates[1..].to_vec(), &examples, &ExpectationMetric, &provider)
            .await
            .unwrap();
        assert_eq!(report.best.demos().len(), 2);
    }
}
