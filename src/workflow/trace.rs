//! Trace Recorder
//!
//! Appends immutable step entries to a run's trace. Entries are redacted
//! and bounded before they reach the store; the store enforces gap-free,
//! in-order step indices and that only the lock holder writes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;

use super::model::{OutputExcerpt, StepOutcome, StepResult, WorkflowRun};
use crate::error::{EngineError, Result};
use crate::runner::output::truncate_utf8;
use crate::runner::redact_text;
use crate::store::RunStore;

/// Longest summary kept in a trace entry.
const SUMMARY_MAX_BYTES: usize = 1024;

/// Everything needed to record one attempted step.
#[derive(Debug, Clone)]
pub struct StepRecord<'a> {
    pub step_index: usize,
    pub step_type: &'a str,
    pub outcome: StepOutcome,
    pub summary: &'a str,
    pub raw_output: &'a str,
    /// Capture was already cut upstream
    pub output_truncated: bool,
    pub started_at: DateTime<Utc>,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct TraceRecorder {
    store: Arc<dyn RunStore>,
    excerpt_bytes: usize,
}

impl TraceRecorder {
    pub fn new(store: Arc<dyn RunStore>, excerpt_bytes: usize) -> Self {
        Self {
            store,
            excerpt_bytes,
        }
    }

    /// Redacts, bounds and appends one entry.
    ///
    /// Returns the stored entry together with the run as it now sits in
    /// the store.
    pub async fn record(
        &self,
        run_id: &str,
        lock_token: &str,
        record: StepRecord<'_>,
    ) -> Result<(StepResult, WorkflowRun)> {
        let entry = self.build_entry(record);

        let stored = self
            .store
            .append_trace(run_id, lock_token, entry.clone())
            .await
            .map_err(EngineError::from)?;

        debug!(
            "Recorded step {} of run {} as {}",
            entry.step_index,
            run_id,
            entry.outcome.as_str()
        );
        Ok((entry, stored))
    }

    /// Returns a run's trace verbatim.
    pub async fn read(&self, run_id: &str) -> Result<Vec<StepResult>> {
        let run = self.store.load(run_id).await?;
        Ok(run.trace().to_vec())
    }

    fn build_entry(&self, record: StepRecord<'_>) -> StepResult {
        let summary = redact_text(record.summary);
        let (summary, _) = truncate_utf8(&summary, SUMMARY_MAX_BYTES);

        // Redact before cutting so a secret split at the boundary is still caught
        let redacted = redact_text(record.raw_output);
        let (excerpt, cut) = truncate_utf8(&redacted, self.excerpt_bytes);

        StepResult {
            step_index: record.step_index,
            step_type: record.step_type.to_string(),
            started_at: record.started_at,
            finished_at: Utc::now(),
            outcome: record.outcome,
            summary: summary.to_string(),
            raw_output_ref: OutputExcerpt {
                text: excerpt.to_string(),
                truncated: cut || record.output_truncated,
            },
            attempts: record.attempts,
        }
    }
}
