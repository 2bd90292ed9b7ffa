//! Workflow Run Data Model
//!
//! Records persisted for each run: the fixed step sequence, the cursor,
//! the append-only trace and the lock fields used for mutual exclusion.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: nightly-sync
//! command_id: cmd-42
//! steps:
//!   - type: command
//!     title: Export records
//!     args: ["exporter", "--run", "{run_id}"]
//!     timeout_ms: 60000
//!     expect_json: true
//!
//!   - type: approval_gate
//!     title: Review export
//!     require_note: true
//!
//!   - type: tool
//!     tool: publish
//!     args:
//!       channel: releases
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::EngineConfig;

/// Lifecycle status of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingApproval,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Terminal runs are never driven again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a run's fixed step sequence.
///
/// The engine treats the payload as opaque apart from turning it into an
/// argument vector; unknown `type` values deserialize to `Unsupported`
/// and are skipped at execution time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDescriptor {
    /// Blocks the run until a human decision is recorded
    #[serde(
        alias = "approval",
        alias = "wait_for_approval",
        alias = "human_input",
        alias = "verify"
    )]
    ApprovalGate {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        instructions: Option<String>,
        #[serde(default)]
        reviewer: Option<String>,
        /// Approval must carry a decision note
        #[serde(default)]
        require_note: bool,
    },

    /// Raw argument vector, program first
    #[serde(alias = "run_command")]
    Command {
        #[serde(default)]
        title: Option<String>,
        args: Vec<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        expect_json: bool,
    },

    /// Gateway tool invocation
    #[serde(alias = "run_tool", alias = "gateway_tool")]
    Tool {
        #[serde(default)]
        title: Option<String>,
        tool: String,
        #[serde(default)]
        args: Map<String, Value>,
        #[serde(default)]
        session_key: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    #[serde(other)]
    Unsupported,
}

/// How a step's stdout should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFamily {
    Raw { expect_json: bool },
    Tool,
}

/// Concrete process invocation derived from a step.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub args: Vec<String>,
    pub timeout: Duration,
    pub family: OutputFamily,
}

impl StepDescriptor {
    /// Short type name used in trace entries.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ApprovalGate { .. } => "approval_gate",
            Self::Command { .. } => "command",
            Self::Tool { .. } => "tool",
            Self::Unsupported => "unsupported",
        }
    }

    /// Human-readable label, falling back to the 1-based position.
    pub fn label(&self, index: usize) -> String {
        let title = match self {
            Self::ApprovalGate { title, .. }
            | Self::Command { title, .. }
            | Self::Tool { title, .. } => title.as_deref(),
            Self::Unsupported => None,
        };
        match title.map(str::trim).filter(|t| !t.is_empty()) {
            Some(title) => title.to_string(),
            None => format!("Step {}", index + 1),
        }
    }

    pub fn is_approval_gate(&self) -> bool {
        matches!(self, Self::ApprovalGate { .. })
    }

    /// Builds the argument vector and timeout for an executable step.
    ///
    /// Returns `None` for approval gates and unsupported steps.
    pub fn to_invocation(
        &self,
        run: &WorkflowRun,
        index: usize,
        config: &EngineConfig,
    ) -> Option<Invocation> {
        match self {
            Self::Command {
                args,
                timeout_ms,
                expect_json,
                ..
            } => {
                let args = args
                    .iter()
                    .map(|arg| substitute_placeholders(arg, run, index))
                    .collect();
                Some(Invocation {
                    args,
                    timeout: config.step_timeout(*timeout_ms),
                    family: OutputFamily::Raw {
                        expect_json: *expect_json,
                    },
                })
            }
            Self::Tool {
                tool,
                args,
                session_key,
                timeout_ms,
                ..
            } => {
                let mut payload = args.clone();
                payload
                    .entry("runId")
                    .or_insert_with(|| Value::String(run.id.clone()));

                let mut argv = vec![
                    config.gateway_bin.clone(),
                    "tools".to_string(),
                    "invoke".to_string(),
                    tool.clone(),
                    "--args".to_string(),
                    Value::Object(payload).to_string(),
                    "--json".to_string(),
                ];
                if !run.command_id.is_empty() {
                    argv.push("--command-id".to_string());
                    argv.push(run.command_id.clone());
                }
                let session = session_key
                    .as_deref()
                    .or(run.session_key.as_deref())
                    .filter(|s| !s.trim().is_empty());
                if let Some(session) = session {
                    argv.push("--session-key".to_string());
                    argv.push(session.to_string());
                }

                Some(Invocation {
                    args: argv,
                    timeout: config.step_timeout(*timeout_ms),
                    family: OutputFamily::Tool,
                })
            }
            Self::ApprovalGate { .. } | Self::Unsupported => None,
        }
    }
}

/// Replaces `{run_id}`, `{command_id}` and `{step_index}` in an argument.
fn substitute_placeholders(arg: &str, run: &WorkflowRun, index: usize) -> String {
    arg.replace("{run_id}", &run.id)
        .replace("{command_id}", &run.command_id)
        .replace("{step_index}", &index.to_string())
}

/// Result classification of an attempted step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
    Skipped,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }
}

/// Bounded, redacted slice of process output kept in the trace.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct OutputExcerpt {
    pub text: String,
    /// Set when the excerpt (or the capture behind it) was cut
    pub truncated: bool,
}

/// Immutable trace entry for one attempted step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step_index: usize,
    pub step_type: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StepOutcome,
    pub summary: String,
    pub raw_output_ref: OutputExcerpt,
    /// Invocations made for this step, retries included
    #[serde(default)]
    pub attempts: u32,
}

/// A human decision on an approval gate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    /// Accepts `approve(d)` / `reject(ed)` in any case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Some(Self::Approved),
            "reject" | "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApprovalDecision {
    pub decision: Decision,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub decided_by: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Persisted state of one workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    /// Opaque, immutable identifier
    pub id: String,

    /// Workflow/command template this run executes
    #[serde(default)]
    pub command_id: String,

    pub status: RunStatus,

    /// Index of the next step to execute
    #[serde(default)]
    pub cursor: usize,

    /// Fixed at creation; never mutated by the engine
    pub steps: Vec<StepDescriptor>,

    #[serde(default)]
    trace: Vec<StepResult>,

    /// Decisions keyed by approval-gate step index
    #[serde(default)]
    pub approvals: BTreeMap<usize, ApprovalDecision>,

    /// Set by an external cancel; honored at the next step boundary
    #[serde(default)]
    pub cancel_requested: bool,

    #[serde(default)]
    pub session_key: Option<String>,

    #[serde(default)]
    pub lock_token: Option<String>,
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub running_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Last fatal error, cleared when a step completes
    #[serde(default)]
    pub error: Option<String>,

    /// Optimistic-concurrency token, bumped by the store on every write
    #[serde(default)]
    pub version: u64,
}

impl WorkflowRun {
    /// Creates a pending run with an empty trace.
    pub fn new(
        id: impl Into<String>,
        command_id: impl Into<String>,
        steps: Vec<StepDescriptor>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into().trim().to_string(),
            command_id: command_id.into().trim().to_string(),
            status: RunStatus::Pending,
            cursor: 0,
            steps,
            trace: Vec::new(),
            approvals: BTreeMap::new(),
            cancel_requested: false,
            session_key: None,
            lock_token: None,
            locked_at: None,
            running_started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
            error: None,
            version: 0,
        }
    }

    pub fn with_session_key(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    /// Read-only view of the trace.
    pub fn trace(&self) -> &[StepResult] {
        &self.trace
    }

    /// Replaces the local trace with the stored one.
    pub(crate) fn set_trace(&mut self, trace: Vec<StepResult>) {
        self.trace = trace;
    }

    /// Step at the cursor, if any remain.
    pub fn current_step(&self) -> Option<&StepDescriptor> {
        self.steps.get(self.cursor)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_token.is_some()
    }

    /// True when the lock was taken longer ago than `ttl`.
    pub fn lock_is_stale(&self, now: DateTime<Utc>, ttl: ChronoDuration) -> bool {
        match self.locked_at {
            Some(at) => now - at > ttl,
            None => self.lock_token.is_some(),
        }
    }

    /// Checks the trace/cursor relationship for the current status.
    ///
    /// A run that failed on a step holds one entry for that step while the
    /// cursor stays on it.
    pub fn trace_consistent(&self) -> bool {
        let indices_ok = self
            .trace
            .iter()
            .enumerate()
            .all(|(i, entry)| entry.step_index == i);
        if !indices_ok {
            return false;
        }

        match self.status {
            RunStatus::Failed => {
                self.trace.len() == self.cursor || self.trace.len() == self.cursor + 1
            }
            RunStatus::WaitingApproval | RunStatus::Succeeded | RunStatus::Canceled => {
                self.trace.len() == self.cursor
            }
            RunStatus::Pending | RunStatus::Running => {
                self.trace.len() == self.cursor || self.trace.len() == self.cursor + 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(args: &[&str]) -> StepDescriptor {
        StepDescriptor::Command {
            title: None,
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout_ms: None,
            expect_json: false,
        }
    }

    #[test]
    fn test_run_creation() {
        let run = WorkflowRun::new(" run-1 ", "cmd", vec![command(&["true"])]);
        assert_eq!(run.id, "run-1");
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.cursor, 0);
        assert!(run.trace().is_empty());
        assert!(!run.is_locked());
        assert!(run.trace_consistent());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(!RunStatus::WaitingApproval.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn test_step_type_aliases() {
        let steps: Vec<StepDescriptor> = serde_yaml::from_str(
            r#"
- type: approval
  title: Check
- type: wait_for_approval
- type: run_command
  args: [echo, hi]
- type: gateway_tool
  tool: sessions_list
"#,
        )
        .unwrap();
        assert!(steps[0].is_approval_gate());
        assert!(steps[1].is_approval_gate());
        assert_eq!(steps[2].kind_name(), "command");
        assert_eq!(steps[3].kind_name(), "tool");
    }

    #[test]
    fn test_unknown_step_type_is_unsupported() {
        let step: StepDescriptor =
            serde_json::from_value(json!({"type": "post_message", "content": "hi"})).unwrap();
        assert_eq!(step, StepDescriptor::Unsupported);
    }

    #[test]
    fn test_label_fallback() {
        let step = command(&["true"]);
        assert_eq!(step.label(2), "Step 3");

        let gate = StepDescriptor::ApprovalGate {
            title: Some("Review".into()),
            instructions: None,
            reviewer: None,
            require_note: false,
        };
        assert_eq!(gate.label(0), "Review");
    }

    #[test]
    fn test_command_invocation_substitutes_placeholders() {
        let run = WorkflowRun::new("r1", "c9", vec![]);
        let step = command(&["export", "--run={run_id}", "{command_id}/{step_index}"]);
        let inv = step.to_invocation(&run, 4, &EngineConfig::default()).unwrap();
        assert_eq!(inv.args, vec!["export", "--run=r1", "c9/4"]);
        assert_eq!(inv.timeout, Duration::from_secs(120));
        assert_eq!(inv.family, OutputFamily::Raw { expect_json: false });
    }

    #[test]
    fn test_tool_invocation() {
        let run = WorkflowRun::new("r1", "c9", vec![]).with_session_key("sess");
        let mut args = Map::new();
        args.insert("channel".into(), json!("ops"));
        let step = StepDescriptor::Tool {
            title: None,
            tool: "publish".into(),
            args,
            session_key: None,
            timeout_ms: Some(5_000),
        };
        let inv = step.to_invocation(&run, 0, &EngineConfig::default()).unwrap();

        assert_eq!(&inv.args[..4], &["gateway", "tools", "invoke", "publish"]);
        let payload: Value = serde_json::from_str(&inv.args[5]).unwrap();
        assert_eq!(payload, json!({"channel": "ops", "runId": "r1"}));
        assert!(inv.args.windows(2).any(|w| w == ["--command-id", "c9"]));
        assert!(inv.args.windows(2).any(|w| w == ["--session-key", "sess"]));
        assert_eq!(inv.timeout, Duration::from_secs(5));
        assert_eq!(inv.family, OutputFamily::Tool);
    }

    #[test]
    fn test_gate_has_no_invocation() {
        let run = WorkflowRun::new("r1", "c", vec![]);
        let gate = StepDescriptor::ApprovalGate {
            title: None,
            instructions: None,
            reviewer: None,
            require_note: false,
        };
        assert!(gate.to_invocation(&run, 0, &EngineConfig::default()).is_none());
    }

    #[test]
    fn test_decision_parse() {
        assert_eq!(Decision::parse("Approved"), Some(Decision::Approved));
        assert_eq!(Decision::parse("reject"), Some(Decision::Rejected));
        assert_eq!(Decision::parse("maybe"), None);
    }

    #[test]
    fn test_stale_lock() {
        let mut run = WorkflowRun::new("r", "c", vec![]);
        let now = Utc::now();
        run.lock_token = Some("t".into());
        run.locked_at = Some(now - ChronoDuration::hours(3));
        assert!(run.lock_is_stale(now, ChronoDuration::hours(2)));

        run.locked_at = Some(now);
        assert!(!run.lock_is_stale(now, ChronoDuration::hours(2)));
    }

    #[test]
    fn test_run_record_serialization() {
        let mut run = WorkflowRun::new("r", "c", vec![command(&["true"])]);
        run.approvals.insert(
            0,
            ApprovalDecision {
                decision: Decision::Approved,
                note: None,
                decided_by: Some("ops".into()),
                decided_at: Utc::now(),
            },
        );
        let json = serde_json::to_string(&run).unwrap();
        assert!(json.contains(r#""status":"pending""#));
        let back: WorkflowRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
    }
}
