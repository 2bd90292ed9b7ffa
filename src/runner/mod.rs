//! Command Runner Module
//!
//! The supervised subprocess boundary every non-approval step goes
//! through: argument vector and timeout in, redacted
//! `{ ok, stdout, stderr, message }` out.
//!
//! - [`command`]: process spawning, timeout enforcement, bounded capture
//! - [`redact`]: secret scrubbing applied to everything captured
//! - [`output`]: best-effort JSON interpretation of stdout

pub mod command;
pub mod output;
pub mod redact;

pub use command::{CommandInvoker, CommandOutput, FailureKind, ProcessRunner};
pub use output::{parse_output, parse_tool_output, StepOutput};
pub use redact::{redact_text, REDACTED};
