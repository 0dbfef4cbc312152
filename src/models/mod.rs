//! Reference models
//!
//! This module contains the ground-truth operator implementations that
//! converted models are judged against:
//! - Group normalization (direct formula, f64 accumulation)

pub mod group_norm;

// Re-exports
pub use group_norm::{group_norm, group_norm_unscaled, GroupNormModel};
