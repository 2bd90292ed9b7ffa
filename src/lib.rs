//! Runkeeper - Resumable Workflow Run Engine
//!
//! Drives multi-step workflow runs through supervised external commands,
//! pausing at human approval gates and persisting after every step so a
//! run can be interrupted and resumed without repeating finished work.
//!
//! # Architecture
//!
//! The library is organized into five main modules:
//!
//! - [`runner`]: Supervised subprocess invocation with timeouts and redaction
//! - [`store`]: Run persistence with optimistic concurrency
//! - [`workflow`]: Run data model, trace recorder and state machine
//! - [`execution`]: Resume controller and external signals
//! - [`config`]: Engine tunables
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use runkeeper::{load_run_definition, EngineConfig, FileRunStore, ProcessRunner, RunController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::load(None)?;
//!     let store = FileRunStore::open(&config.store_dir).await?;
//!     let runner = ProcessRunner::from_config(&config);
//!
//!     let run = load_run_definition("nightly.yaml", &config)?;
//!     let controller = RunController::new(Arc::new(store), Arc::new(runner), config);
//!     let run = controller.create_run(run).await?;
//!
//!     let outcome = controller.execute_manual_workflow_run(&run.id).await?;
//!     println!("status: {}", outcome.run.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod runner;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use execution::{ResumeOutcome, RunController};
pub use runner::{CommandInvoker, ProcessRunner};
pub use store::{FileRunStore, MemoryRunStore, RunStore};
pub use workflow::model::{RunStatus, StepDescriptor, StepResult, WorkflowRun};
pub use workflow::parser::load_run_definition;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Runkeeper";
