//! In-memory run store
//!
//! Used by tests and embedded callers. All mutations happen under one
//! write lock, so compare-and-swap is trivially linearizable.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{apply_append, apply_swap, check_id, Result, RunStore, StoreError};
use crate::workflow::model::{StepResult, WorkflowRun};

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<String, WorkflowRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, WorkflowRun>>> {
        self.runs
            .write()
            .map_err(|e| StoreError::Lock(format!("write lock poisoned: {}", e)))
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, WorkflowRun>>> {
        self.runs
            .read()
            .map_err(|e| StoreError::Lock(format!("read lock poisoned: {}", e)))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert(&self, mut run: WorkflowRun) -> Result<WorkflowRun> {
        check_id(&run.id)?;
        let mut runs = self.write_lock()?;
        if runs.contains_key(&run.id) {
            return Err(StoreError::AlreadyExists(run.id));
        }
        run.version = 0;
        runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn load(&self, id: &str) -> Result<WorkflowRun> {
        self.read_lock()?
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn compare_and_swap(
        &self,
        run: WorkflowRun,
        expected_version: u64,
    ) -> Result<WorkflowRun> {
        let mut runs = self.write_lock()?;
        let stored = runs
            .get(&run.id)
            .ok_or_else(|| StoreError::NotFound(run.id.clone()))?;
        let next = apply_swap(stored, run, expected_version)?;
        runs.insert(next.id.clone(), next.clone());
        Ok(next)
    }

    async fn append_trace(
        &self,
        id: &str,
        lock_token: &str,
        entry: StepResult,
    ) -> Result<WorkflowRun> {
        let mut runs = self.write_lock()?;
        let stored = runs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let next = apply_append(stored, lock_token, entry)?;
        runs.insert(next.id.clone(), next.clone());
        Ok(next)
    }
}
