//! rofy-agent: sandboxed tool-use orchestration
//!
//! This crate drives the multi-pass model/tool loop that edits a project
//! sandbox, relays the model's output to live connections, and runs the
//! structured planning turn.

pub mod accumulator;
pub mod bus;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod relay;
pub mod sandbox;
pub mod store;
pub mod tool;
pub mod tools;

#[cfg(test)]
mod testing;

pub use bus::{SessionBus, Subscription};
pub use error::{Error, Result, StoreError, ToolError};
pub use events::{CollectSink, EventSink, SessionEvent, ToolProgress, Verb};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome, RunRequest};
pub use plan::{AppPlan, PlanEvent, PlanOutcome, Planner, PlannerConfig};
pub use registry::{RunHandle, RunRegistry, RunStatus};
pub use sandbox::Sandbox;
pub use store::{DurableStore, FileStore, MemoryStore};
pub use tool::{SharedTool, Tool, ToolKind, ToolOutput, ToolSet};
