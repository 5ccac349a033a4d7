//! Tool-call orchestration for Conduit.

mod orchestrator;

pub use orchestrator::{MAX_TOOL_ITERATIONS, ModelSettings, Orchestrator, TurnEvent, TurnOutcome};
