//! # actcraft agent
//!
//! The agent drives one step at a time:
//! 1. The executor or user records observations with `observe`
//! 2. `step` reduces the history to a bounded context
//! 3. The active program turns the context into the next action
//! 4. Unparseable completions are re-prompted with a correction
//! 5. The action is recorded and handed back for execution
//!
//! Programs are swapped only between steps, either explicitly with `adopt`
//! or by picking up a publication from the optimizer.

mod agent;
mod factory;

pub use agent::{Agent, AgentState};
pub use factory::build_agent;
