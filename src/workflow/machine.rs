//! Workflow Run State Machine
//!
//! Drives a locked run from its cursor until it blocks or finishes:
//!
//! ```text
//! pending -> running -> { waiting_approval <-> running } -> { succeeded | failed | canceled }
//! ```
//!
//! Steps run strictly one after another in a loop. Every change is
//! written back before the next step starts, so a crash loses at most the
//! step in flight.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};

use super::model::{
    Decision, Invocation, OutputFamily, RunStatus, StepDescriptor, StepOutcome, WorkflowRun,
};
use super::trace::{StepRecord, TraceRecorder};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::runner::{parse_output, parse_tool_output, CommandInvoker, CommandOutput, FailureKind};
use crate::store::{RunStore, StoreError};

/// Compare-and-swap attempts before a write is abandoned.
const PERSIST_ATTEMPTS: usize = 5;

/// Executes steps of one run on behalf of the lock holder.
pub struct StateMachine {
    invoker: Arc<dyn CommandInvoker>,
    store: Arc<dyn RunStore>,
    recorder: TraceRecorder,
    config: Arc<EngineConfig>,
}

/// What happened to an executable step after all attempts.
enum StepVerdict {
    Succeeded { summary: String, raw: String, truncated: bool },
    Failed { error: EngineError, raw: String, truncated: bool },
}

impl StateMachine {
    pub fn new(
        invoker: Arc<dyn CommandInvoker>,
        store: Arc<dyn RunStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let recorder = TraceRecorder::new(Arc::clone(&store), config.trace_excerpt_bytes);
        Self {
            invoker,
            store,
            recorder,
            config,
        }
    }

    pub fn recorder(&self) -> &TraceRecorder {
        &self.recorder
    }

    /// Runs `run` until it waits for approval or reaches a terminal status.
    ///
    /// `run` must be the stored record with this caller's lock token set.
    /// Terminal runs come back with the lock already cleared; a run
    /// waiting for approval still carries it.
    pub async fn drive(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        let token = run.lock_token.clone().ok_or_else(|| {
            EngineError::InvalidRequest(format!("run {} is not locked", run.id))
        })?;
        let mut run = run;
        let mut steps_taken = 0usize;

        info!(
            "Driving run {} from step {} of {}",
            run.id,
            run.cursor,
            run.steps.len()
        );

        loop {
            run = self.refresh(&run, &token).await?;

            // A trace entry at the cursor means a previous worker died
            // between recording the step and moving the cursor
            if let Some(existing) = run.trace().get(run.cursor) {
                let outcome = existing.outcome;
                let summary = existing.summary.clone();
                warn!(
                    "Run {} already has a {} entry for step {}; not re-running it",
                    run.id,
                    outcome.as_str(),
                    run.cursor
                );
                match outcome {
                    StepOutcome::Success | StepOutcome::Skipped => {
                        run.cursor += 1;
                        run.error = None;
                        run = self.persist(run, &token).await?;
                        continue;
                    }
                    StepOutcome::Failure => {
                        return self.finish(run, &token, RunStatus::Failed, Some(summary)).await;
                    }
                }
            }

            if run.cancel_requested {
                info!("Run {} canceled at step {}", run.id, run.cursor);
                return self.finish(run, &token, RunStatus::Canceled, None).await;
            }

            let index = run.cursor;
            let Some(step) = run.current_step().cloned() else {
                info!("Run {} completed all {} steps", run.id, run.steps.len());
                return self.finish(run, &token, RunStatus::Succeeded, None).await;
            };

            if steps_taken >= self.config.max_iterations {
                error!("Run {} exceeded {} iterations", run.id, self.config.max_iterations);
                let message = "exceeded max step iterations".to_string();
                return self.finish(run, &token, RunStatus::Failed, Some(message)).await;
            }
            steps_taken += 1;

            if run.status != RunStatus::Running {
                run.status = RunStatus::Running;
            }

            match &step {
                StepDescriptor::ApprovalGate { .. } => {
                    let Some(decision) = run.approvals.get(&index).cloned() else {
                        info!(
                            "Run {} waiting for approval at step {} ({})",
                            run.id,
                            index,
                            step.label(index)
                        );
                        run.status = RunStatus::WaitingApproval;
                        return self.persist(run, &token).await;
                    };

                    let who = decision.decided_by.as_deref().unwrap_or("unknown");
                    let note = decision.note.as_deref().unwrap_or("");
                    let (outcome, summary) = match decision.decision {
                        Decision::Approved => (
                            StepOutcome::Success,
                            join_note(format!("approved by {}", who), note),
                        ),
                        Decision::Rejected => (
                            StepOutcome::Failure,
                            join_note(format!("rejected by {}", who), note),
                        ),
                    };
                    let started_at = decision.decided_at;
                    run = self
                        .record(&run, &token, index, &step, outcome, &summary, "", false, started_at, 0)
                        .await?;

                    if outcome == StepOutcome::Failure {
                        warn!("Run {} rejected at step {}", run.id, index);
                        let message = format!("approval {}", summary);
                        return self.finish(run, &token, RunStatus::Failed, Some(message)).await;
                    }
                    run.cursor += 1;
                    run.error = None;
                    run = self.persist(run, &token).await?;
                }

                StepDescriptor::Unsupported => {
                    warn!("Skipping unsupported step {} of run {}", index, run.id);
                    let started_at = Utc::now();
                    run = self
                        .record(
                            &run,
                            &token,
                            index,
                            &step,
                            StepOutcome::Skipped,
                            "unsupported step type; skipped",
                            "",
                            false,
                            started_at,
                            0,
                        )
                        .await?;
                    run.cursor += 1;
                    run = self.persist(run, &token).await?;
                }

                StepDescriptor::Command { .. } | StepDescriptor::Tool { .. } => {
                    let Some(invocation) = step.to_invocation(&run, index, &self.config) else {
                        return Err(EngineError::Internal(format!(
                            "step {} produced no invocation",
                            index
                        )));
                    };

                    let started_at = Utc::now();
                    let (verdict, attempts) = self.execute(&run.id, index, &step, &invocation).await;

                    match verdict {
                        StepVerdict::Succeeded {
                            summary,
                            raw,
                            truncated,
                        } => {
                            run = self
                                .record(
                                    &run,
                                    &token,
                                    index,
                                    &step,
                                    StepOutcome::Success,
                                    &summary,
                                    &raw,
                                    truncated,
                                    started_at,
                                    attempts,
                                )
                                .await?;
                            run.cursor += 1;
                            run.error = None;
                            run = self.persist(run, &token).await?;
                        }
                        StepVerdict::Failed {
                            error,
                            raw,
                            truncated,
                        } => {
                            let message = error.to_string();
                            run = self
                                .record(
                                    &run,
                                    &token,
                                    index,
                                    &step,
                                    StepOutcome::Failure,
                                    &message,
                                    &raw,
                                    truncated,
                                    started_at,
                                    attempts,
                                )
                                .await?;
                            return self.finish(run, &token, RunStatus::Failed, Some(message)).await;
                        }
                    }
                }
            }
        }
    }

    /// Runs one executable step, retrying retryable failures.
    ///
    /// The parsed [`StepOutput`](crate::runner::StepOutput) only shapes the
    /// summary line. The trace keeps the redacted stdout itself, so nothing
    /// downstream trusts the output's structure.
    async fn execute(
        &self,
        run_id: &str,
        index: usize,
        step: &StepDescriptor,
        invocation: &Invocation,
    ) -> (StepVerdict, u32) {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(
                "Run {} step {} attempt {}/{}",
                run_id, index, attempt, max_attempts
            );

            let output = match self.invoker.invoke(&invocation.args, invocation.timeout).await {
                Ok(output) => output,
                Err(e) => {
                    error!("Run {} step {} rejected before spawning: {}", run_id, index, e);
                    let error = EngineError::StepFatal {
                        step_index: index,
                        message: e.to_string(),
                    };
                    return (failed(error, None), attempt);
                }
            };

            if output.ok {
                let parsed = match invocation.family {
                    OutputFamily::Raw { expect_json } => parse_output(&output.stdout, expect_json),
                    OutputFamily::Tool => parse_tool_output(&output.stdout),
                };
                let summary = format!(
                    "{}: {} ({})",
                    step.label(index),
                    output.message,
                    parsed.describe()
                );
                info!("Run {} step {} succeeded", run_id, index);
                let verdict = StepVerdict::Succeeded {
                    summary,
                    raw: output.stdout,
                    truncated: output.stdout_truncated,
                };
                return (verdict, attempt);
            }

            if output.is_retryable() && attempt < max_attempts {
                let delay = self.config.retry_backoff(attempt);
                warn!(
                    "Run {} step {} attempt {} failed ({}); retrying in {:?}",
                    run_id, index, attempt, output.message, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let error = classify_failure(index, &output, attempt);
            error!("Run {} step {} failed: {}", run_id, index, error);
            return (failed(error, Some(output)), attempt);
        }
    }

    /// Loads the stored record and checks this caller still owns it.
    async fn refresh(&self, run: &WorkflowRun, token: &str) -> Result<WorkflowRun> {
        let stored = self.store.load(&run.id).await?;
        if stored.lock_token.as_deref() != Some(token) {
            return Err(EngineError::LockContention(run.id.clone()));
        }
        if stored.status.is_terminal() {
            return Err(EngineError::StoreConflict(format!(
                "run {} became {} while locked",
                run.id, stored.status
            )));
        }
        Ok(stored)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        run: &WorkflowRun,
        token: &str,
        index: usize,
        step: &StepDescriptor,
        outcome: StepOutcome,
        summary: &str,
        raw: &str,
        truncated: bool,
        started_at: chrono::DateTime<Utc>,
        attempts: u32,
    ) -> Result<WorkflowRun> {
        let record = StepRecord {
            step_index: index,
            step_type: step.kind_name(),
            outcome,
            summary,
            raw_output: raw,
            output_truncated: truncated,
            started_at,
            attempts,
        };
        let (_, stored) = self.recorder.record(&run.id, token, record).await?;
        Ok(adopt_engine_fields(stored, run))
    }

    /// Writes a terminal status and drops the lock in the same write.
    async fn finish(
        &self,
        mut run: WorkflowRun,
        token: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<WorkflowRun> {
        run.status = status;
        run.error = error;
        run.finished_at = Some(Utc::now());
        run.lock_token = None;
        run.locked_at = None;
        self.persist(run, token).await
    }

    /// Compare-and-swap with merge on conflict.
    ///
    /// Conflicts come from external signals (approval decisions, cancel
    /// requests) landing between writes; their fields are kept and the
    /// engine-owned fields are re-applied on top.
    async fn persist(&self, run: WorkflowRun, token: &str) -> Result<WorkflowRun> {
        let mut candidate = run;

        for _ in 0..PERSIST_ATTEMPTS {
            let expected = candidate.version;
            match self.store.compare_and_swap(candidate.clone(), expected).await {
                Ok(saved) => return Ok(saved),
                Err(StoreError::Conflict(reason)) => {
                    debug!("Persist of run {} conflicted: {}", candidate.id, reason);
                    let stored = self.store.load(&candidate.id).await?;
                    if stored.lock_token.as_deref() != Some(token) {
                        return Err(EngineError::LockContention(candidate.id.clone()));
                    }
                    if stored.status.is_terminal() {
                        return Err(EngineError::StoreConflict(reason));
                    }
                    candidate = adopt_engine_fields(stored, &candidate);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::StoreConflict(format!(
            "run {} kept changing; gave up after {} attempts",
            candidate.id, PERSIST_ATTEMPTS
        )))
    }
}

/// Takes `stored` and re-applies the fields only the lock holder writes.
fn adopt_engine_fields(stored: WorkflowRun, ours: &WorkflowRun) -> WorkflowRun {
    let mut next = stored;
    next.status = ours.status;
    next.cursor = ours.cursor;
    next.error = ours.error.clone();
    next.lock_token = ours.lock_token.clone();
    next.locked_at = ours.locked_at;
    next.running_started_at = ours.running_started_at;
    next.finished_at = ours.finished_at;
    next
}

/// Maps the last failed invocation to the error taxonomy.
fn classify_failure(index: usize, output: &CommandOutput, attempts: u32) -> EngineError {
    match &output.failure {
        Some(FailureKind::Timeout(timeout)) if attempts <= 1 => EngineError::StepTimeout {
            step_index: index,
            timeout: *timeout,
        },
        Some(FailureKind::Spawn { .. }) if attempts <= 1 => EngineError::StepSpawnFailure {
            step_index: index,
            message: output.message.clone(),
        },
        Some(FailureKind::Timeout(_)) | Some(FailureKind::Spawn { .. }) => EngineError::StepFatal {
            step_index: index,
            message: format!("{} (gave up after {} attempts)", output.message, attempts),
        },
        Some(FailureKind::NonZeroExit(_)) | None => EngineError::StepFatal {
            step_index: index,
            message: output.message.clone(),
        },
    }
}

fn failed(error: EngineError, output: Option<CommandOutput>) -> StepVerdict {
    let (raw, truncated) = match output {
        Some(output) => {
            let truncated = output.stdout_truncated || output.stderr_truncated;
            let raw = match (output.stdout.trim().is_empty(), output.stderr.trim().is_empty()) {
                (true, true) => String::new(),
                (false, true) => output.stdout,
                (true, false) => output.stderr,
                (false, false) => format!("{}\n--- stderr ---\n{}", output.stdout, output.stderr),
            };
            (raw, truncated)
        }
        None => (String::new(), false),
    };
    StepVerdict::Failed {
        error,
        raw,
        truncated,
    }
}

fn join_note(head: String, note: &str) -> String {
    let note = note.trim();
    if note.is_empty() {
        head
    } else {
        format!("{}: {}", head, note)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::runner::redact_text;
    use crate::store::MemoryRunStore;
    use crate::workflow::model::ApprovalDecision;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Invoker that replays scripted outputs and records every call.
    #[derive(Default)]
    pub(crate) struct ScriptedInvoker {
        script: Mutex<VecDeque<CommandOutput>>,
        pub(crate) calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedInvoker {
        pub(crate) fn new(outputs: Vec<CommandOutput>) -> Self {
            Self {
                script: Mutex::new(outputs.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CommandInvoker for ScriptedInvoker {
        async fn invoke(&self, args: &[String], _timeout: Duration) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(args.to_vec());
            let next = self.script.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| CommandOutput::success("", "")))
        }
    }

    pub(crate) fn ok(stdout: &str) -> CommandOutput {
        CommandOutput::success(stdout, "")
    }

    pub(crate) fn exit_failure(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput::failed(
            FailureKind::NonZeroExit(Some(code)),
            &format!("exited with status {}: {}", code, stderr),
            "",
            stderr,
        )
    }

    pub(crate) fn timeout() -> CommandOutput {
        let limit = Duration::from_millis(50);
        CommandOutput::failed(FailureKind::Timeout(limit), "timed out after 50ms", "", "")
    }

    pub(crate) fn command(program: &str) -> StepDescriptor {
        StepDescriptor::Command {
            title: None,
            args: vec![program.to_string()],
            timeout_ms: Some(1_000),
            expect_json: false,
        }
    }

    pub(crate) fn gate() -> StepDescriptor {
        StepDescriptor::ApprovalGate {
            title: Some("Review".into()),
            instructions: None,
            reviewer: None,
            require_note: false,
        }
    }

    pub(crate) fn fast_config() -> EngineConfig {
        EngineConfig {
            retry_backoff_base_ms: 1,
            retry_backoff_max_ms: 2,
            ..EngineConfig::default()
        }
    }

    struct Harness {
        store: Arc<MemoryRunStore>,
        invoker: Arc<ScriptedInvoker>,
        machine: StateMachine,
    }

    fn harness(outputs: Vec<CommandOutput>, config: EngineConfig) -> Harness {
        let store = Arc::new(MemoryRunStore::new());
        let invoker = Arc::new(ScriptedInvoker::new(outputs));
        let machine = StateMachine::new(invoker.clone(), store.clone(), Arc::new(config));
        Harness {
            store,
            invoker,
            machine,
        }
    }

    /// Inserts a run and takes its lock the way the controller does.
    async fn insert_locked(store: &MemoryRunStore, steps: Vec<StepDescriptor>) -> WorkflowRun {
        let run = store.insert(WorkflowRun::new("run-1", "cmd-1", steps)).await.unwrap();
        let mut locked = run.clone();
        locked.lock_token = Some("tok".into());
        locked.locked_at = Some(Utc::now());
        locked.status = RunStatus::Running;
        store.compare_and_swap(locked, run.version).await.unwrap()
    }

    #[tokio::test]
    async fn test_runs_all_steps_to_success() {
        let h = harness(vec![ok(r#"{"a":1}"#), ok("plain")], fast_config());
        let run = insert_locked(&h.store, vec![command("one"), command("two")]).await;

        let done = h.machine.drive(run).await.unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.cursor, 2);
        assert_eq!(done.trace().len(), 2);
        assert!(done.lock_token.is_none());
        assert!(done.finished_at.is_some());
        assert!(done.trace_consistent());
        assert!(done.trace()[0].summary.contains("json object"));
        assert_eq!(h.invoker.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_on_middle_step() {
        let h = harness(vec![ok(""), exit_failure(1, "boom")], fast_config());
        let run = insert_locked(&h.store, vec![command("a"), command("b"), command("c")]).await;

        let done = h.machine.drive(run).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.cursor, 1);
        assert_eq!(done.trace().len(), 2);
        assert_eq!(done.trace()[0].outcome, StepOutcome::Success);
        assert_eq!(done.trace()[1].outcome, StepOutcome::Failure);
        assert!(done.error.as_deref().unwrap_or("").contains("boom"));
        assert!(done.lock_token.is_none());
        assert_eq!(h.invoker.call_count(), 2);
    }

    #[tokio::test]
    async fn test_timeout_retried_then_failed() {
        let h = harness(vec![timeout(), timeout(), timeout()], fast_config());
        let run = insert_locked(&h.store, vec![command("slow")]).await;

        let done = h.machine.drive(run).await.unwrap();
        assert_eq!(h.invoker.call_count(), 3);
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.trace().len(), 1);
        assert_eq!(done.trace()[0].outcome, StepOutcome::Failure);
        assert_eq!(done.trace()[0].attempts, 3);
        assert!(done.error.as_deref().unwrap_or("").contains("gave up after 3 attempts"));
    }

    #[tokio::test]
    async fn test_timeout_then_success() {
        let h = harness(vec![timeout(), ok("")], fast_config());
        let run = insert_locked(&h.store, vec![command("flaky")]).await;

        let done = h.machine.drive(run).await.unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.trace()[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_non_zero_exit_not_retried() {
        let h = harness(vec![exit_failure(2, "bad input")], fast_config());
        let run = insert_locked(&h.store, vec![command("strict")]).await;

        let done = h.machine.drive(run).await.unwrap();
        assert_eq!(h.invoker.call_count(), 1);
        assert_eq!(done.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_approval_gate_blocks_without_trace_entry() {
        let h = harness(vec![ok("")], fast_config());
        let run = insert_locked(&h.store, vec![command("prep"), gate(), command("after")]).await;

        let waiting = h.machine.drive(run).await.unwrap();
        assert_eq!(waiting.status, RunStatus::WaitingApproval);
        assert_eq!(waiting.cursor, 1);
        assert_eq!(waiting.trace().len(), 1);
        assert!(waiting.trace_consistent());
        assert_eq!(waiting.lock_token.as_deref(), Some("tok"));
        assert_eq!(h.invoker.call_count(), 1);
    }

    #[tokio::test]
    async fn test_approved_gate_advances() {
        let h = harness(vec![], fast_config());
        let mut run = insert_locked(&h.store, vec![gate(), command("after")]).await;
        run.approvals.insert(
            0,
            ApprovalDecision {
                decision: Decision::Approved,
                note: Some("ship it".into()),
                decided_by: Some("ops".into()),
                decided_at: Utc::now(),
            },
        );
        let run = h.store.compare_and_swap(run.clone(), run.version).await.unwrap();

        let done = h.machine.drive(run).await.unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.trace()[0].summary, "approved by ops: ship it");
        assert_eq!(h.invoker.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_gate_fails_run() {
        let h = harness(vec![], fast_config());
        let mut run = insert_locked(&h.store, vec![gate(), command("after")]).await;
        run.approvals.insert(
            0,
            ApprovalDecision {
                decision: Decision::Rejected,
                note: Some("not today".into()),
                decided_by: None,
                decided_at: Utc::now(),
            },
        );
        let run = h.store.compare_and_swap(run.clone(), run.version).await.unwrap();

        let done = h.machine.drive(run).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.cursor, 0);
        assert_eq!(done.trace()[0].outcome, StepOutcome::Failure);
        assert!(done.error.as_deref().unwrap_or("").contains("not today"));
        assert_eq!(h.invoker.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_step_skipped() {
        let h = harness(vec![], fast_config());
        let run = insert_locked(&h.store, vec![StepDescriptor::Unsupported, command("x")]).await;

        let done = h.machine.drive(run).await.unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.trace()[0].outcome, StepOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_cancel_request_honored_at_boundary() {
        let h = harness(vec![], fast_config());
        let mut run = insert_locked(&h.store, vec![command("a")]).await;
        run.cancel_requested = true;
        let run = h.store.compare_and_swap(run.clone(), run.version).await.unwrap();

        let done = h.machine.drive(run).await.unwrap();
        assert_eq!(done.status, RunStatus::Canceled);
        assert_eq!(done.trace().len(), done.cursor);
        assert!(done.lock_token.is_none());
        assert_eq!(h.invoker.call_count(), 0);
    }

    #[tokio::test]
    async fn test_existing_entry_not_re_executed() {
        let h = harness(vec![], fast_config());
        let run = insert_locked(&h.store, vec![command("done-before-crash"), command("next")]).await;
        h.machine
            .recorder()
            .record(
                "run-1",
                "tok",
                StepRecord {
                    step_index: 0,
                    step_type: "command",
                    outcome: StepOutcome::Success,
                    summary: "ok",
                    raw_output: "",
                    output_truncated: false,
                    started_at: Utc::now(),
                    attempts: 1,
                },
            )
            .await
            .unwrap();

        let done = h.machine.drive(run).await.unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.trace().len(), 2);
        // Only step 1 ran
        assert_eq!(h.invoker.call_count(), 1);
        assert_eq!(h.invoker.calls.lock().unwrap()[0], vec!["next".to_string()]);
    }

    #[tokio::test]
    async fn test_loop_guard() {
        let config = EngineConfig {
            max_iterations: 2,
            ..fast_config()
        };
        let h = harness(vec![], config);
        let run = insert_locked(&h.store, vec![command("a"), command("b"), command("c")]).await;

        let done = h.machine.drive(run).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("exceeded max step iterations"));
        assert_eq!(done.trace().len(), done.cursor);
        assert_eq!(h.invoker.call_count(), 2);
    }

    #[tokio::test]
    async fn test_secrets_never_reach_trace() {
        let leaky = CommandOutput::failed(
            FailureKind::NonZeroExit(Some(1)),
            r#"exited with status 1: {"password":"x"}"#,
            "Authorization: Bearer abc123",
            r#"{"password":"x"}"#,
        );
        let h = harness(vec![leaky], fast_config());
        let run = insert_locked(&h.store, vec![command("leak")]).await;

        let done = h.machine.drive(run).await.unwrap();
        let stored = serde_json::to_string(&done).unwrap();
        assert!(!stored.contains("abc123"));
        assert!(!stored.contains(r#"\"password\":\"x\""#));
        assert_eq!(redact_text(done.error.as_deref().unwrap()), done.error.clone().unwrap());
    }

    #[tokio::test]
    async fn test_tool_envelope_secrets_never_reach_trace() {
        let envelope = r#"{"result":{"content":[{"type":"text","text":"{\"user\":\"bob\",\"password\":\"hunter2\",\"api_key\":\"sk-live-999\"}"}]}}"#;
        let h = harness(vec![ok(envelope)], fast_config());
        let step = StepDescriptor::Tool {
            title: None,
            tool: "accounts.lookup".into(),
            args: serde_json::Map::new(),
            session_key: None,
            timeout_ms: None,
        };
        let run = insert_locked(&h.store, vec![step]).await;

        let done = h.machine.drive(run).await.unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        let stored = serde_json::to_string(&h.store.load("run-1").await.unwrap()).unwrap();
        assert!(!stored.contains("hunter2"));
        assert!(!stored.contains("sk-live-999"));

        let raw = &done.trace()[0].raw_output_ref.text;
        assert!(raw.contains("bob"));
        assert!(raw.contains("[redacted]"));
        assert!(done.trace()[0].summary.contains("tool result (json)"));
    }

    #[tokio::test]
    async fn test_placeholders_reach_invoker() {
        let h = harness(vec![], fast_config());
        let step = StepDescriptor::Command {
            title: None,
            args: vec!["report".into(), "{run_id}".into(), "{step_index}".into()],
            timeout_ms: None,
            expect_json: false,
        };
        let run = insert_locked(&h.store, vec![step]).await;
        h.machine.drive(run).await.unwrap();
        assert_eq!(
            h.invoker.calls.lock().unwrap()[0],
            vec!["report".to_string(), "run-1".to_string(), "0".to_string()]
        );
    }

    #[tokio::test]
    async fn test_persist_keeps_signal_written_mid_step() {
        let h = harness(vec![], fast_config());
        let run = insert_locked(&h.store, vec![command("a"), command("b")]).await;

        // A cancel request lands after the engine last read the record
        let mut signalled = run.clone();
        signalled.cancel_requested = true;
        h.store.compare_and_swap(signalled, run.version).await.unwrap();

        let mut ours = run.clone();
        ours.cursor = 1;
        let saved = h.machine.persist(ours, "tok").await.unwrap();
        assert_eq!(saved.cursor, 1);
        assert!(saved.cancel_requested);
        assert_eq!(saved.lock_token.as_deref(), Some("tok"));
        assert_eq!(saved.status, RunStatus::Running);
        assert_eq!(h.store.load("run-1").await.unwrap(), saved);
    }

    #[tokio::test]
    async fn test_persist_gives_up_when_lock_lost() {
        let h = harness(vec![], fast_config());
        let run = insert_locked(&h.store, vec![command("a")]).await;

        let mut stolen = run.clone();
        stolen.lock_token = Some("other".into());
        h.store.compare_and_swap(stolen, run.version).await.unwrap();

        let mut ours = run.clone();
        ours.cursor = 1;
        let result = h.machine.persist(ours, "tok").await;
        assert!(matches!(result, Err(EngineError::LockContention(_))));
        assert_eq!(h.store.load("run-1").await.unwrap().cursor, 0);
    }

    #[tokio::test]
    async fn test_requires_lock() {
        let h = harness(vec![], fast_config());
        let run = h
            .store
            .insert(WorkflowRun::new("free", "c", vec![command("a")]))
            .await
            .unwrap();
        let result = h.machine.drive(run).await;
        assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_lost_lock_stops_driving() {
        let h = harness(vec![], fast_config());
        let run = insert_locked(&h.store, vec![command("a")]).await;
        let mut stolen = run.clone();
        stolen.lock_token = Some("other".into());
        h.store.compare_and_swap(stolen, run.version).await.unwrap();

        let result = h.machine.drive(run).await;
        assert!(matches!(result, Err(EngineError::LockContention(_))));
        assert_eq!(h.invoker.call_count(), 0);
    }
}
