//! Run Storage
//!
//! Backend-agnostic persistence for workflow runs with:
//! - optimistic concurrency through a per-run version counter
//! - an append-only trace that only grows through [`RunStore::append_trace`]
//! - terminal runs that never change status again
//!
//! Implementations for process memory and a directory of JSON files.

mod file;
mod memory;

pub use file::FileRunStore;
pub use memory::MemoryRunStore;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::workflow::model::{StepResult, WorkflowRun};

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Version moved, lock lost, or the run is already terminal
    #[error("conflict: {0}")]
    Conflict(String),

    /// Trace entry index does not match the stored trace length
    #[error("out of order: {0}")]
    OutOfOrder(String),

    #[error("invalid run id: {0}")]
    InvalidId(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence interface for workflow runs.
///
/// Every successful write bumps `version` by one and refreshes
/// `updated_at`; callers hold on to the returned record.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Stores a new run. Fails if the id is taken.
    async fn insert(&self, run: WorkflowRun) -> Result<WorkflowRun>;

    /// Loads the current record.
    async fn load(&self, id: &str) -> Result<WorkflowRun>;

    /// Replaces the record if its version still equals `expected_version`.
    ///
    /// The trace in `run` is ignored; the stored trace is kept.
    async fn compare_and_swap(&self, run: WorkflowRun, expected_version: u64)
        -> Result<WorkflowRun>;

    /// Appends one trace entry on behalf of the lock holder.
    async fn append_trace(
        &self,
        id: &str,
        lock_token: &str,
        entry: StepResult,
    ) -> Result<WorkflowRun>;
}

/// Builds the record a compare-and-swap would store.
pub(crate) fn apply_swap(
    stored: &WorkflowRun,
    mut run: WorkflowRun,
    expected_version: u64,
) -> Result<WorkflowRun> {
    if stored.version != expected_version {
        return Err(StoreError::Conflict(format!(
            "run {} is at version {}, expected {}",
            stored.id, stored.version, expected_version
        )));
    }
    if stored.status.is_terminal() && run.status != stored.status {
        return Err(StoreError::Conflict(format!(
            "run {} is already {}",
            stored.id, stored.status
        )));
    }
    run.id = stored.id.clone();
    run.created_at = stored.created_at;
    run.set_trace(stored.trace().to_vec());
    run.version = stored.version + 1;
    run.updated_at = Utc::now();
    Ok(run)
}

/// Builds the record after appending `entry` to the stored trace.
pub(crate) fn apply_append(
    stored: &WorkflowRun,
    lock_token: &str,
    entry: StepResult,
) -> Result<WorkflowRun> {
    if stored.lock_token.as_deref() != Some(lock_token) {
        return Err(StoreError::Conflict(format!(
            "lock on run {} is not held by this caller",
            stored.id
        )));
    }
    if stored.status.is_terminal() {
        return Err(StoreError::Conflict(format!(
            "run {} is already {}",
            stored.id, stored.status
        )));
    }
    let expected = stored.trace().len();
    if entry.step_index != expected {
        return Err(StoreError::OutOfOrder(format!(
            "run {} expects trace entry {}, got {}",
            stored.id, expected, entry.step_index
        )));
    }

    let mut next = stored.clone();
    let mut trace = stored.trace().to_vec();
    trace.push(entry);
    next.set_trace(trace);
    next.version = stored.version + 1;
    next.updated_at = Utc::now();
    Ok(next)
}

/// Rejects ids that cannot double as file names.
pub(crate) fn check_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}
