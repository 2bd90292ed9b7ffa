//! Workflow Run Module
//!
//! Data structures for runs and the state machine that drives them.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowRun, StepDescriptor, StepResult)
//! - [`parser`]: Loading run definitions from YAML or JSON
//! - [`validator`]: Step sequence checks at creation time
//! - [`trace`]: Append-only execution trace
//! - [`machine`]: Step-by-step execution of a locked run

pub mod machine;
pub mod model;
pub mod parser;
pub mod trace;
pub mod validator;

pub use machine::StateMachine;
pub use model::{
    ApprovalDecision, Decision, RunStatus, StepDescriptor, StepOutcome, StepResult, WorkflowRun,
};
pub use parser::{load_run_definition, parse_run_definition, RunDefinition};
pub use trace::TraceRecorder;
pub use validator::validate_steps;
