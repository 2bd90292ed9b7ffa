//! Resume Controller
//!
//! Public entry point for driving a run:
//! - loads the run and replays terminal results without executing anything
//! - takes the run's lock through compare-and-swap, failing fast on contention
//! - drives the state machine on its own task until the run blocks or ends
//! - releases the lock on every exit path, including panics
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use runkeeper::config::EngineConfig;
//! use runkeeper::execution::RunController;
//! use runkeeper::runner::ProcessRunner;
//! use runkeeper::store::MemoryRunStore;
//!
//! # async fn demo() -> runkeeper::error::Result<()> {
//! let config = EngineConfig::default();
//! let controller = RunController::new(
//!     Arc::new(MemoryRunStore::new()),
//!     Arc::new(ProcessRunner::from_config(&config)),
//!     config,
//! );
//! let outcome = controller.execute_manual_workflow_run("nightly").await?;
//! println!("{} -> {}", outcome.run.id, outcome.http_status());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use super::signals;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::runner::CommandInvoker;
use crate::store::{RunStore, StoreError};
use crate::workflow::model::{Decision, RunStatus, StepResult, WorkflowRun};
use crate::workflow::{validate_steps, StateMachine};

/// Message stored on runs whose worker failed unexpectedly.
const UNEXPECTED_FAILURE: &str = "workflow run failed unexpectedly";

/// Attempts to clear a lock before giving up.
const RELEASE_ATTEMPTS: usize = 5;

/// Result of one resume call.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ResumeOutcome {
    pub ok: bool,
    pub waiting_approval: bool,
    pub run: WorkflowRun,
    pub error: Option<String>,
}

impl ResumeOutcome {
    pub fn from_run(run: WorkflowRun) -> Self {
        let waiting_approval = run.status == RunStatus::WaitingApproval;
        let ok = run.status != RunStatus::Failed;
        let error = if ok { None } else { run.error.clone() };
        Self {
            ok,
            waiting_approval,
            run,
            error,
        }
    }

    /// 202 while waiting on approval, 200 when fine, 502 on failure.
    pub fn http_status(&self) -> u16 {
        if self.waiting_approval {
            202
        } else if self.ok {
            200
        } else {
            502
        }
    }
}

/// Drives runs stored in a [`RunStore`] through a [`CommandInvoker`].
///
/// Cheap to clone; clones share the store, runner and configuration.
#[derive(Clone)]
pub struct RunController {
    store: Arc<dyn RunStore>,
    machine: Arc<StateMachine>,
    config: Arc<EngineConfig>,
}

impl RunController {
    pub fn new(
        store: Arc<dyn RunStore>,
        invoker: Arc<dyn CommandInvoker>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let machine = StateMachine::new(invoker, Arc::clone(&store), Arc::clone(&config));
        Self {
            store,
            machine: Arc::new(machine),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates and stores a new pending run.
    pub async fn create_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        validate_steps(&run.steps, &self.config)?;
        if run.status != RunStatus::Pending || !run.trace().is_empty() || run.cursor != 0 {
            return Err(EngineError::InvalidRequest(
                "new runs must be pending with an empty trace".into(),
            ));
        }
        let stored = self.store.insert(run).await.map_err(|e| match e {
            StoreError::AlreadyExists(id) => {
                EngineError::InvalidRequest(format!("run {} already exists", id))
            }
            other => other.into(),
        })?;
        info!("Created run {} with {} steps", stored.id, stored.steps.len());
        Ok(stored)
    }

    /// Resumes a run until it waits for approval or reaches a terminal status.
    pub async fn execute_manual_workflow_run(&self, run_id: &str) -> Result<ResumeOutcome> {
        let run = self.store.load(run_id).await?;

        if run.status.is_terminal() {
            debug!("Run {} is already {}; replaying result", run_id, run.status);
            return Ok(ResumeOutcome::from_run(run));
        }

        let (claimed, token) = self.acquire(run).await?;
        info!("Acquired lock on run {}", run_id);

        let machine = Arc::clone(&self.machine);
        let handle = tokio::spawn(async move { machine.drive(claimed).await });

        let driven = match handle.await {
            Ok(result) => result,
            Err(join_error) => {
                error!("Worker for run {} died: {}", run_id, join_error);
                Err(EngineError::Internal(UNEXPECTED_FAILURE.to_string()))
            }
        };

        match driven {
            Ok(run) => {
                let run = self.release(run, &token).await;
                info!("Run {} is now {}", run.id, run.status);
                Ok(ResumeOutcome::from_run(run))
            }
            Err(e @ EngineError::LockContention(_)) => {
                warn!("Run {} lost its lock while running", run_id);
                Err(e)
            }
            Err(e) => {
                error!("Resume of run {} failed: {}", run_id, e);
                self.fail_unexpectedly(run_id, &token).await;
                Err(e)
            }
        }
    }

    /// Returns the run's trace without executing anything.
    pub async fn get_workflow_run_trace(&self, run_id: &str) -> Result<Vec<StepResult>> {
        self.machine.recorder().read(run_id).await
    }

    /// Loads a run without executing anything.
    pub async fn get_workflow_run(&self, run_id: &str) -> Result<WorkflowRun> {
        Ok(self.store.load(run_id).await?)
    }

    pub async fn decide_approval(
        &self,
        run_id: &str,
        decision: Decision,
        note: Option<String>,
        actor: Option<String>,
    ) -> Result<WorkflowRun> {
        signals::decide_approval(self.store.as_ref(), run_id, decision, note, actor).await
    }

    pub async fn request_cancel(&self, run_id: &str) -> Result<WorkflowRun> {
        signals::request_cancel(self.store.as_ref(), run_id, self.config.lock_ttl()).await
    }

    /// Claims the lock, taking over abandoned ones.
    async fn acquire(&self, run: WorkflowRun) -> Result<(WorkflowRun, String)> {
        let now = Utc::now();
        if run.is_locked() {
            if !run.lock_is_stale(now, self.config.lock_ttl()) {
                return Err(EngineError::LockContention(run.id));
            }
            warn!(
                "Taking over abandoned lock on run {} (locked at {:?})",
                run.id, run.locked_at
            );
        }

        let token = Uuid::new_v4().to_string();
        let id = run.id.clone();
        let expected = run.version;
        let mut claimed = run;
        claimed.lock_token = Some(token.clone());
        claimed.locked_at = Some(now);
        claimed.status = RunStatus::Running;
        claimed.running_started_at.get_or_insert(now);

        match self.store.compare_and_swap(claimed, expected).await {
            Ok(saved) => Ok((saved, token)),
            Err(StoreError::Conflict(reason)) => {
                debug!("Lost lock race: {}", reason);
                Err(EngineError::LockContention(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Clears the lock if this caller still holds it.
    ///
    /// Failures are logged, not returned: the drive already succeeded and
    /// a stuck lock expires after the configured TTL.
    async fn release(&self, run: WorkflowRun, token: &str) -> WorkflowRun {
        if run.lock_token.as_deref() != Some(token) {
            return run;
        }

        let mut current = run;
        for _ in 0..RELEASE_ATTEMPTS {
            let mut next = current.clone();
            next.lock_token = None;
            next.locked_at = None;
            match self.store.compare_and_swap(next, current.version).await {
                Ok(saved) => {
                    debug!("Released lock on run {}", saved.id);
                    return saved;
                }
                Err(StoreError::Conflict(_)) => match self.store.load(&current.id).await {
                    Ok(stored) if stored.lock_token.as_deref() == Some(token) => current = stored,
                    Ok(stored) => return stored,
                    Err(e) => {
                        warn!("Failed to reload run {} for unlock: {}", current.id, e);
                        return current;
                    }
                },
                Err(e) => {
                    warn!("Failed to release lock on run {}: {}", current.id, e);
                    return current;
                }
            }
        }
        error!("Gave up releasing lock on run {}", current.id);
        current
    }

    /// Marks a run failed after an unexpected error and drops the lock.
    async fn fail_unexpectedly(&self, run_id: &str, token: &str) {
        for _ in 0..RELEASE_ATTEMPTS {
            let stored = match self.store.load(run_id).await {
                Ok(stored) => stored,
                Err(e) => {
                    error!("Cannot load run {} to record failure: {}", run_id, e);
                    return;
                }
            };
            if stored.lock_token.as_deref() != Some(token) {
                return;
            }

            let expected = stored.version;
            let mut failed = stored;
            if !failed.status.is_terminal() {
                failed.status = RunStatus::Failed;
                failed.error = Some(UNEXPECTED_FAILURE.to_string());
                failed.finished_at = Some(Utc::now());
            }
            failed.lock_token = None;
            failed.locked_at = None;

            match self.store.compare_and_swap(failed, expected).await {
                Ok(_) => {
                    warn!("Marked run {} failed and released its lock", run_id);
                    return;
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => {
                    error!("Failed to record failure of run {}: {}", run_id, e);
                    return;
                }
            }
        }
        error!("Gave up recording failure of run {}", run_id);
    }
}
