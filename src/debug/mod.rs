//! Debug and validation utilities
//!
//! Tools for judging converted models against the reference:
//! - Tolerance comparison and the aggregate verdict
//! - NPY file reading and writing for external runners
//! - Tensor-name diagnostics for trace artifacts

mod artifact_diagnostics;
mod npy;
mod validator;

pub use artifact_diagnostics::KeyReport;
pub use npy::{load_npy, load_npy_tensor, save_npy_f32, save_npy_tensor, NpyArray};
pub use validator::{
    is_close, CaseComparison, Comparator, ComparisonReport, Mismatch, ToleranceConfig,
};
