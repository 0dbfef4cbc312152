//! Conformance harness
//!
//! This module provides the main entry point for a run:
//! - ConformanceHarness: stage-by-stage pipeline
//! - RunOutcome: verdict plus the files the run produced
//! - StageError: fatal error tagged with the failing stage

mod pipeline;

pub use pipeline::{ConformanceHarness, RunOutcome, Stage, StageError};
