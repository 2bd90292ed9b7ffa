//! External Run Signals
//!
//! Human-side writes into a run record: approval decisions and cancel
//! requests. Neither executes anything; the state machine observes them
//! on the next resume or at the next step boundary.
//!
//! Both are compare-and-swap loops that only touch externally owned
//! fields, so they can land while a resume holds the lock.

use chrono::Utc;
use log::{debug, info};

use crate::error::{EngineError, Result};
use crate::store::{RunStore, StoreError};
use crate::workflow::model::{ApprovalDecision, Decision, RunStatus, StepDescriptor, WorkflowRun};

/// Reload-and-retry attempts on a version conflict.
const SIGNAL_ATTEMPTS: usize = 5;

/// Records a decision for the approval gate at the run's cursor.
///
/// Only valid while the run is waiting for approval. Gates with
/// `require_note` refuse an approval without a note.
pub async fn decide_approval(
    store: &dyn RunStore,
    run_id: &str,
    decision: Decision,
    note: Option<String>,
    actor: Option<String>,
) -> Result<WorkflowRun> {
    let note = note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
    let actor = actor.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());

    for _ in 0..SIGNAL_ATTEMPTS {
        let mut run = store.load(run_id).await?;

        if run.status != RunStatus::WaitingApproval {
            return Err(EngineError::InvalidRequest(format!(
                "run {} is not waiting for approval (status: {})",
                run_id, run.status
            )));
        }
        let index = run.cursor;
        let require_note = match run.current_step() {
            Some(StepDescriptor::ApprovalGate { require_note, .. }) => *require_note,
            _ => {
                return Err(EngineError::InvalidRequest(format!(
                    "step {} of run {} is not an approval gate",
                    index, run_id
                )))
            }
        };
        if require_note && decision == Decision::Approved && note.is_none() {
            return Err(EngineError::InvalidRequest(format!(
                "step {} requires a note to approve",
                index
            )));
        }

        run.approvals.insert(
            index,
            ApprovalDecision {
                decision,
                note: note.clone(),
                decided_by: actor.clone(),
                decided_at: Utc::now(),
            },
        );

        let expected = run.version;
        match store.compare_and_swap(run, expected).await {
            Ok(saved) => {
                info!(
                    "Recorded {:?} for step {} of run {}",
                    decision, index, run_id
                );
                return Ok(saved);
            }
            Err(StoreError::Conflict(reason)) => {
                debug!("Approval write for {} conflicted: {}", run_id, reason);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(EngineError::StoreConflict(format!(
        "run {} kept changing while recording a decision",
        run_id
    )))
}

/// Asks for a run to stop.
///
/// An idle run is canceled on the spot. A run that is being driven gets
/// `cancel_requested` and stops at its next step boundary.
pub async fn request_cancel(
    store: &dyn RunStore,
    run_id: &str,
    lock_ttl: chrono::Duration,
) -> Result<WorkflowRun> {
    for _ in 0..SIGNAL_ATTEMPTS {
        let mut run = store.load(run_id).await?;

        match run.status {
            RunStatus::Canceled => return Ok(run),
            status if status.is_terminal() => {
                return Err(EngineError::InvalidRequest(format!(
                    "run {} is already {}",
                    run_id, status
                )))
            }
            _ => {}
        }

        let now = Utc::now();
        let driven = run.is_locked() && !run.lock_is_stale(now, lock_ttl);
        // An entry past the cursor needs a resume to reconcile first
        let unreconciled = run.trace().len() > run.cursor;

        run.cancel_requested = true;
        if !driven && !unreconciled {
            run.status = RunStatus::Canceled;
            run.finished_at = Some(now);
            run.lock_token = None;
            run.locked_at = None;
        }

        let expected = run.version;
        match store.compare_and_swap(run, expected).await {
            Ok(saved) => {
                if saved.status == RunStatus::Canceled {
                    info!("Canceled run {}", run_id);
                } else {
                    info!("Cancel requested for run {}", run_id);
                }
                return Ok(saved);
            }
            Err(StoreError::Conflict(reason)) => {
                debug!("Cancel write for {} conflicted: {}", run_id, reason);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(EngineError::StoreConflict(format!(
        "run {} kept changing while requesting cancel",
        run_id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRunStore;
    use crate::workflow::model::StepDescriptor;

    fn gate(require_note: bool) -> StepDescriptor {
        StepDescriptor::ApprovalGate {
            title: None,
            instructions: None,
            reviewer: None,
            require_note,
        }
    }

    async fn waiting_run(store: &MemoryRunStore, require_note: bool) -> WorkflowRun {
        let run = store
            .insert(WorkflowRun::new("w-1", "c", vec![gate(require_note)]))
            .await
            .unwrap();
        let mut waiting = run.clone();
        waiting.status = RunStatus::WaitingApproval;
        store.compare_and_swap(waiting, run.version).await.unwrap()
    }

    fn ttl() -> chrono::Duration {
        chrono::Duration::hours(2)
    }

    #[tokio::test]
    async fn test_approve_records_decision() {
        let store = MemoryRunStore::new();
        waiting_run(&store, false).await;

        let run = decide_approval(&store, "w-1", Decision::Approved, None, Some(" ops ".into()))
            .await
            .unwrap();
        let decision = &run.approvals[&0];
        assert_eq!(decision.decision, Decision::Approved);
        assert_eq!(decision.decided_by.as_deref(), Some("ops"));
        // Steps are never touched
        assert_eq!(run.steps, vec![gate(false)]);
    }

    #[tokio::test]
    async fn test_required_note_enforced() {
        let store = MemoryRunStore::new();
        waiting_run(&store, true).await;

        let missing = decide_approval(&store, "w-1", Decision::Approved, Some("  ".into()), None).await;
        assert!(matches!(missing, Err(EngineError::InvalidRequest(_))));

        let ok = decide_approval(&store, "w-1", Decision::Approved, Some("checked".into()), None).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_decision_requires_waiting_status() {
        let store = MemoryRunStore::new();
        store
            .insert(WorkflowRun::new("p-1", "c", vec![gate(false)]))
            .await
            .unwrap();
        let result = decide_approval(&store, "p-1", Decision::Approved, None, None).await;
        assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_decision_unknown_run() {
        let store = MemoryRunStore::new();
        let result = decide_approval(&store, "nope", Decision::Rejected, None, None).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_idle_run_is_immediate() {
        let store = MemoryRunStore::new();
        waiting_run(&store, false).await;

        let run = request_cancel(&store, "w-1", ttl()).await.unwrap();
        assert_eq!(run.status, RunStatus::Canceled);
        assert!(run.finished_at.is_some());
        assert!(run.trace_consistent());

        // Idempotent
        let again = request_cancel(&store, "w-1", ttl()).await.unwrap();
        assert_eq!(again.status, RunStatus::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_locked_run_is_deferred() {
        let store = MemoryRunStore::new();
        let run = store
            .insert(WorkflowRun::new("l-1", "c", vec![gate(false)]))
            .await
            .unwrap();
        let mut locked = run.clone();
        locked.status = RunStatus::Running;
        locked.lock_token = Some("tok".into());
        locked.locked_at = Some(Utc::now());
        store.compare_and_swap(locked, run.version).await.unwrap();

        let run = request_cancel(&store, "l-1", ttl()).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.cancel_requested);
        assert_eq!(run.lock_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_cancel_terminal_run_rejected() {
        let store = MemoryRunStore::new();
        let run = store
            .insert(WorkflowRun::new("d-1", "c", vec![gate(false)]))
            .await
            .unwrap();
        let mut done = run.clone();
        done.status = RunStatus::Succeeded;
        store.compare_and_swap(done, run.version).await.unwrap();

        let result = request_cancel(&store, "d-1", ttl()).await;
        assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    }
}
