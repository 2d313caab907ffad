//! Agent module - the analysis pipeline and tool-calling loop.
//!
//! The agent follows a "tools in a loop" pattern:
//! 1. Seed the conversation with the persona and the bound analysis prompt
//! 2. Call the model with the advertised tools
//! 3. If the model requests tool calls, execute them and feed results back
//! 4. Repeat until the model answers or the round cap is reached

mod agent_loop;
mod prompt;
mod run;

pub use agent_loop::{
    LogEntryType, LoopPolicy, Orchestrator, RunFailure, RunLog, RunLogEntry, RunOutcome,
};
pub use prompt::Persona;
pub use run::{parse_content, AnalysisError, Analyst, RunContext, NO_DATA};
