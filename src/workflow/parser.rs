//! Run Definition Parser
//!
//! Loads the definition an external trigger hands over when creating a
//! run: an optional id, the command template id and the step sequence.
//! YAML is the primary format; JSON documents parse as well.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;
use uuid::Uuid;

use super::model::{StepDescriptor, WorkflowRun};
use super::validator::validate_steps;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// On-disk shape of a run definition.
#[derive(Deserialize, Debug, Clone)]
pub struct RunDefinition {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default, alias = "commandId")]
    pub command_id: String,

    #[serde(default, alias = "sessionKey")]
    pub session_key: Option<String>,

    pub steps: Vec<StepDescriptor>,
}

impl RunDefinition {
    /// Builds a validated, pending run from this definition.
    pub fn into_run(self, config: &EngineConfig) -> Result<WorkflowRun> {
        validate_steps(&self.steps, config)?;

        let id = match self.id.map(|id| id.trim().to_string()) {
            Some(id) if !id.is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };

        let mut run = WorkflowRun::new(id, self.command_id, self.steps);
        if let Some(key) = self.session_key.filter(|k| !k.trim().is_empty()) {
            run = run.with_session_key(key);
        }
        Ok(run)
    }
}

/// Parses a run definition from YAML (or JSON) text.
pub fn parse_run_definition(content: &str) -> Result<RunDefinition> {
    serde_yaml::from_str(content).map_err(|e| {
        EngineError::InvalidDefinition(format!(
            "Failed to parse run definition: {}. Check the file format.",
            e
        ))
    })
}

/// Loads a run definition file and builds a pending run from it.
///
/// # Example
///
/// ```rust,no_run
/// use runkeeper::config::EngineConfig;
/// use runkeeper::workflow::load_run_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let run = load_run_definition("nightly.yaml", &EngineConfig::default())?;
///     println!("Run {} has {} steps", run.id, run.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_run_definition(path: impl AsRef<Path>, config: &EngineConfig) -> Result<WorkflowRun> {
    let path = path.as_ref();
    info!("Loading run definition from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        EngineError::InvalidDefinition(format!(
            "Failed to read run definition '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;
    debug!("Definition loaded ({} bytes)", content.len());

    let definition = parse_run_definition(&content)?;
    info!("Parsed {} steps", definition.steps.len());

    definition.into_run(config)
}
