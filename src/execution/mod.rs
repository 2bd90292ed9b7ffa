//! Workflow Execution Module
//!
//! The public surface for driving and steering runs.
//!
//! # Architecture
//!
//! - [`controller`]: Resume entry point with lock acquisition and release
//! - [`signals`]: Approval decisions and cancel requests from humans

pub mod controller;
pub mod signals;

pub use controller::{ResumeOutcome, RunController};
pub use signals::{decide_approval, request_cancel};
