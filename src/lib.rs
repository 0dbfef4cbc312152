//! # groupnorm-conformance
//!
//! Checks that converting a traced graph into an inference-engine
//! representation preserves the numerics of group normalization.
//!
//! ## Pipeline
//!
//! - Seeded cases: input shape, group count, epsilon, affine parameters
//! - Reference outputs from the direct group normalization formula
//! - Export to one trace artifact, conversion, execution
//! - Elementwise tolerance comparison reduced to a single verdict
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use groupnorm_conformance::{ConformanceHarness, HarnessConfig};
//!
//! let mut harness = ConformanceHarness::new(HarnessConfig::default());
//! let outcome = harness.run()?;
//! std::process::exit(outcome.exit_code());
//! ```

// Require docs for public items
#![warn(missing_docs)]

pub mod adapters;
pub mod cases;
pub mod config;
pub mod debug;
pub mod error;
pub mod harness;
pub mod models;
pub mod utils;

// Re-exports for convenience
pub use cases::{CaseSpec, GroupNormCase, DEFAULT_EPS};
pub use config::{Backend, HarnessConfig};
pub use debug::{Comparator, ComparisonReport, ToleranceConfig};
pub use error::ConformanceError;
pub use harness::{ConformanceHarness, RunOutcome, Stage, StageError};
pub use models::GroupNormModel;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit status when a stage fails before a verdict exists
pub const EXIT_FATAL: i32 = 2;
