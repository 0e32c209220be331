//! # History Reducer
//!
//! Turns an unbounded event log into a bounded, ordered [`Context`].
//!
//! The kept events are always a suffix of the log, borrowed rather than
//! copied. Under [`OverflowPolicy::Summarize`] the dropped prefix is folded
//! into a deterministic [`Summary`] placed ahead of the window.

use crate::action::ActionKind;
use crate::event::{estimate_tokens, BudgetUnit, Event, EventPayload, EventSource};
use serde::{Deserialize, Serialize};

/// Size limit for a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub limit: usize,
    #[serde(default)]
    pub unit: BudgetUnit,
}

impl Budget {
    pub fn items(limit: usize) -> Self {
        Self {
            limit,
            unit: BudgetUnit::Items,
        }
    }

    pub fn tokens(limit: usize) -> Self {
        Self {
            limit,
            unit: BudgetUnit::Tokens,
        }
    }
}

/// What happens to events that do not fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    Summarize,
}

/// Deterministic digest of dropped events
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub first_seq: u64,
    pub last_seq: u64,
    pub event_count: usize,
    pub actions: Vec<ActionKind>,
    pub user_messages: Vec<String>,
    pub observations: usize,
    pub failed_observations: usize,
}

impl Summary {
    fn of(events: &[Event]) -> Option<Self> {
        let (first, last) = (events.first()?, events.last()?);
        let mut summary = Summary {
            first_seq: first.seq,
            last_seq: last.seq,
            event_count: events.len(),
            actions: Vec::new(),
            user_messages: Vec::new(),
            observations: 0,
            failed_observations: 0,
        };

        for event in events {
            match &event.payload {
                EventPayload::Action(action) => summary.actions.push(action.kind()),
                EventPayload::Observation(obs) => {
                    summary.observations += 1;
                    if obs.is_failure() {
                        summary.failed_observations += 1;
                    }
                }
                EventPayload::Message { content } if event.source == EventSource::User => {
                    summary.user_messages.push(content.clone());
                }
                EventPayload::Message { .. } => {}
            }
        }
        Some(summary)
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "SUMMARY of events {}..={} ({} omitted)",
            self.first_seq, self.last_seq, self.event_count
        );
        if !self.actions.is_empty() {
            let kinds: Vec<_> = self.actions.iter().map(ActionKind::as_str).collect();
            out.push_str(&format!("\nactions taken: {}", kinds.join(", ")));
        }
        for message in &self.user_messages {
            out.push_str(&format!("\nuser said: {}", message));
        }
        if self.observations > 0 {
            out.push_str(&format!(
                "\nobservations: {} ({} failed)",
                self.observations, self.failed_observations
            ));
        }
        out
    }

    pub fn size(&self, unit: BudgetUnit) -> usize {
        match unit {
            BudgetUnit::Items => 1,
            BudgetUnit::Tokens => estimate_tokens(&self.render()),
        }
    }
}

/// Bounded view over an event log, handed to a program
#[derive(Debug, Clone)]
pub struct Context<'a> {
    pub summary: Option<Summary>,
    /// Suffix of the log kept verbatim
    pub window: &'a [Event],
    /// Cut-down copy of the newest event when it alone exceeds the budget
    pub truncated: Option<Event>,
    /// Number of log events not present verbatim
    pub dropped: usize,
    /// Corrective instructions appended after a rejected completion
    pub corrections: Vec<String>,
    pub budget: Budget,
}

impl<'a> Context<'a> {
    pub fn empty(budget: Budget) -> Self {
        Self {
            summary: None,
            window: &[],
            truncated: None,
            dropped: 0,
            corrections: Vec::new(),
            budget,
        }
    }

    /// Events in temporal order, the truncated one last
    pub fn events(&self) -> impl Iterator<Item = &Event> + '_ {
        self.window.iter().chain(self.truncated.as_ref())
    }

    pub fn seqs(&self) -> Vec<u64> {
        self.events().map(|e| e.seq).collect()
    }

    /// Items present, summary included
    pub fn len(&self) -> usize {
        self.window.len() + usize::from(self.truncated.is_some()) + usize::from(self.summary.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in the budget's unit
    pub fn size(&self) -> usize {
        let unit = self.budget.unit;
        self.summary.as_ref().map_or(0, |s| s.size(unit))
            + self.events().map(|e| e.size(unit)).sum::<usize>()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated.is_some()
    }

    pub fn with_correction(mut self, correction: impl Into<String>) -> Self {
        self.corrections.push(correction.into());
        self
    }
}

/// Reduces event history to fit a budget
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryReducer {
    policy: OverflowPolicy,
}

impl HistoryReducer {
    pub fn new(policy: OverflowPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn reduce<'a>(&self, events: &'a [Event], budget: Budget) -> Context<'a> {
        let context = self.reduce_inner(events, budget);
        tracing::debug!(
            total = events.len(),
            kept = context.window.len(),
            dropped = context.dropped,
            summarized = context.summary.is_some(),
            truncated = context.is_truncated(),
            "reduced history"
        );
        context
    }

    fn reduce_inner<'a>(&self, events: &'a [Event], budget: Budget) -> Context<'a> {
        let Some(last) = events.last() else {
            return Context::empty(budget);
        };
        if budget.limit == 0 {
            return Context::empty(budget);
        }

        let unit = budget.unit;
        let mut start = events.len();
        let mut used = 0;
        for event in events.iter().rev() {
            let size = event.size(unit);
            if used + size > budget.limit {
                break;
            }
            used += size;
            start -= 1;
        }

        if start == events.len() {
            return Context {
                dropped: events.len() - 1,
                truncated: Some(last.truncated_to(budget.limit)),
                ..Context::empty(budget)
            };
        }

        let kept = Context {
            window: &events[start..],
            dropped: start,
            ..Context::empty(budget)
        };
        if self.policy == OverflowPolicy::DropOldest || start == 0 {
            return kept;
        }

        // Shrink from the old end until the summary fits beside the window.
        while start < events.len() {
            if let Some(summary) = Summary::of(&events[..start]) {
                if used + summary.size(unit) <= budget.limit {
                    return Context {
                        summary: Some(summary),
                        window: &events[start..],
                        dropped: start,
                        ..Context::empty(budget)
                    };
                }
            }
            if events.len() - start <= 1 {
                break;
            }
            used -= events[start].size(unit);
            start += 1;
        }

        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::event::{EventLog, Observation};

    fn log_of(n: usize) -> EventLog {
        let mut log = EventLog::new();
        for i in 0..n {
            if i % 2 == 0 {
                log.append(EventSource::Agent, EventPayload::Action(Action::run(format!("echo {}", i))));
            } else {
                log.append(
                    EventSource::Environment,
                    EventPayload::Observation(Observation::new(format!("{}", i - 1)).with_exit_code(0)),
                );
            }
        }
        log
    }

    #[test]
    fn test_empty_history() {
        let ctx = HistoryReducer::default().reduce(&[], Budget::items(10));
        assert!(ctx.is_empty());
        assert!(!ctx.is_truncated());
    }

    #[test]
    fn test_keeps_most_recent_in_order() {
        let log = log_of(100);
        let ctx = HistoryReducer::default().reduce(log.as_slice(), Budget::items(5));

        assert_eq!(ctx.seqs(), vec![95, 96, 97, 98, 99]);
        assert_eq!(ctx.dropped, 95);
        assert_eq!(ctx.size(), 5);
    }

    #[test]
    fn test_zero_budget_is_empty() {
        let log = log_of(3);
        let ctx = HistoryReducer::default().reduce(log.as_slice(), Budget::items(0));
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_fits_entirely() {
        let log = log_of(4);
        let ctx = HistoryReducer::new(OverflowPolicy::Summarize).reduce(log.as_slice(), Budget::items(10));
        assert_eq!(ctx.seqs(), vec![0, 1, 2, 3]);
        assert!(ctx.summary.is_none());
    }

    #[test]
    fn test_deterministic() {
        let log = log_of(40);
        let reducer = HistoryReducer::new(OverflowPolicy::Summarize);
        let a = reducer.reduce(log.as_slice(), Budget::tokens(30));
        let b = reducer.reduce(log.as_slice(), Budget::tokens(30));

        assert_eq!(a.seqs(), b.seqs());
        assert_eq!(a.summary, b.summary);
    }

    #[test]
    fn test_size_never_exceeds_budget() {
        let log = log_of(60);
        for policy in [OverflowPolicy::DropOldest, OverflowPolicy::Summarize] {
            let reducer = HistoryReducer::new(policy);
            for limit in [1, 2, 3, 7, 20, 45] {
                for budget in [Budget::items(limit), Budget::tokens(limit)] {
                    let ctx = reducer.reduce(log.as_slice(), budget);
                    assert!(ctx.size() <= limit, "{:?} {:?}", policy, budget);
                    let seqs = ctx.seqs();
                    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
                    assert_eq!(seqs.last(), Some(&59));
                }
            }
        }
    }

    #[test]
    fn test_oversized_last_event_is_truncated() {
        let mut log = log_of(2);
        log.append(
            EventSource::Environment,
            EventPayload::Observation(Observation::new("y".repeat(1000))),
        );

        let ctx = HistoryReducer::default().reduce(log.as_slice(), Budget::tokens(50));
        assert!(ctx.is_truncated());
        assert!(ctx.window.is_empty());
        assert_eq!(ctx.seqs(), vec![2]);
        assert!(ctx.size() <= 50);
    }

    #[test]
    fn test_summarize_replaces_prefix() {
        let mut log = EventLog::new();
        log.append(EventSource::User, EventPayload::message("please fix the tests"));
        for i in 0..9 {
            log.append(EventSource::Agent, EventPayload::Action(Action::run(format!("step {}", i))));
        }

        let ctx = HistoryReducer::new(OverflowPolicy::Summarize).reduce(log.as_slice(), Budget::items(4));
        let summary = ctx.summary.as_ref().unwrap();

        assert_eq!(ctx.seqs(), vec![7, 8, 9]);
        assert_eq!((summary.first_seq, summary.last_seq), (0, 6));
        assert_eq!(summary.user_messages, vec!["please fix the tests".to_string()]);
        assert_eq!(summary.actions.len(), 6);
        assert!(summary.render().contains("user said: please fix the tests"));
        assert_eq!(ctx.size(), 4);
    }

    #[test]
    fn test_summary_omitted_when_it_cannot_fit() {
        let log = log_of(10);
        let ctx = HistoryReducer::new(OverflowPolicy::Summarize).reduce(log.as_slice(), Budget::items(1));
        assert!(ctx.summary.is_none());
        assert_eq!(ctx.seqs(), vec![9]);
    }
}
