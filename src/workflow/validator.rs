//! Step Sequence Validation
//!
//! Checks a run's step sequence once, at creation. The sequence is fixed
//! afterwards, so anything rejected here can never reach the runner.

use log::{debug, info, warn};

use super::model::StepDescriptor;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    EmptyArgs(usize),
    EmptyProgram(usize),
    EmptyTool(usize),
    ReservedToolArg { step: usize, key: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow run has no steps"),
            Self::EmptyArgs(i) => write!(f, "Step {} has an empty argument list", i),
            Self::EmptyProgram(i) => write!(f, "Step {} has an empty program name", i),
            Self::EmptyTool(i) => write!(f, "Step {} has no tool specified", i),
            Self::ReservedToolArg { step, key } => {
                write!(f, "Step {}: tool argument '{}' is reserved", step, key)
            }
        }
    }
}

/// Tool arguments the engine fills in itself.
const RESERVED_TOOL_ARGS: &[&str] = &["commandId", "sessionKey"];

/// Validates a single step's fields.
fn validate_step(index: usize, step: &StepDescriptor) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    match step {
        StepDescriptor::Command { args, .. } => match args.first() {
            None => errors.push(ValidationError::EmptyArgs(index)),
            Some(program) if program.trim().is_empty() => {
                errors.push(ValidationError::EmptyProgram(index))
            }
            Some(_) => {}
        },
        StepDescriptor::Tool { tool, args, .. } => {
            if tool.trim().is_empty() {
                errors.push(ValidationError::EmptyTool(index));
            }
            for key in RESERVED_TOOL_ARGS {
                if args.contains_key(*key) {
                    errors.push(ValidationError::ReservedToolArg {
                        step: index,
                        key: key.to_string(),
                    });
                }
            }
        }
        StepDescriptor::ApprovalGate { .. } => {}
        StepDescriptor::Unsupported => {
            warn!("Step {} has an unsupported type and will be skipped", index);
        }
    }

    errors
}

/// Validates a step sequence before a run is created.
///
/// All problems are collected and reported together, one per line.
pub fn validate_steps(steps: &[StepDescriptor], config: &EngineConfig) -> Result<()> {
    info!("Validating run with {} steps", steps.len());

    if steps.is_empty() {
        return Err(EngineError::InvalidDefinition(
            ValidationError::EmptyWorkflow.to_string(),
        ));
    }

    let mut all_errors = Vec::new();
    for (index, step) in steps.iter().enumerate() {
        all_errors.extend(validate_step(index, step));

        let requested = match step {
            StepDescriptor::Command { timeout_ms, .. } | StepDescriptor::Tool { timeout_ms, .. } => {
                *timeout_ms
            }
            _ => None,
        };
        if let Some(ms) = requested {
            if ms > config.max_step_timeout_ms {
                warn!(
                    "Step {} requests {} ms; it will be capped at {} ms",
                    index, ms, config.max_step_timeout_ms
                );
            }
        }
    }

    if !all_errors.is_empty() {
        let messages: Vec<String> = all_errors.iter().map(|e| e.to_string()).collect();
        return Err(EngineError::InvalidDefinition(messages.join("\n")));
    }

    debug!("Step sequence is valid");
    Ok(())
}
