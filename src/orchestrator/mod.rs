//! Application-level orchestration utilities.
//!
//! This module owns run lifecycle control (launch/cancel) and post-run processing
//! such as rescanning result files. UI/CLI layers call into this module to keep
//! responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{run_controller, UiCommand};
pub(crate) use post_process::{process_run_completion, snapshot, ProcessedRun, Snapshot};
