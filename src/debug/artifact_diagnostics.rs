//! Tensor-name diagnostics for trace artifacts
//!
//! A converter or exporter that silently drops a parameter produces an
//! artifact that still loads but computes something else. This module
//! compares the tensor names a graph references against the names the
//! artifact actually stores.

use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Expected vs. available tensor names for one artifact
#[derive(Debug, Clone)]
pub struct KeyReport {
    /// Artifact the keys were read from
    pub artifact: String,
    /// All keys stored in the artifact
    pub available_keys: BTreeSet<String>,
    /// Keys the graph references
    pub expected_keys: BTreeSet<String>,
    /// Keys that were expected but missing
    pub missing_keys: BTreeSet<String>,
    /// Keys stored but never referenced
    pub extra_keys: BTreeSet<String>,
}

impl KeyReport {
    /// Build a report from the two key sets
    pub fn new<A, E>(artifact: &str, available: A, expected: E) -> Self
    where
        A: IntoIterator<Item = String>,
        E: IntoIterator<Item = String>,
    {
        let available_keys: BTreeSet<String> = available.into_iter().collect();
        let expected_keys: BTreeSet<String> = expected.into_iter().collect();

        let missing_keys = expected_keys.difference(&available_keys).cloned().collect();
        let extra_keys = available_keys.difference(&expected_keys).cloned().collect();

        Self {
            artifact: artifact.to_string(),
            available_keys,
            expected_keys,
            missing_keys,
            extra_keys,
        }
    }

    /// Ratio of found keys to expected keys
    pub fn success_rate(&self) -> f32 {
        if self.expected_keys.is_empty() {
            return 1.0;
        }
        let found = self.expected_keys.len() - self.missing_keys.len();
        found as f32 / self.expected_keys.len() as f32
    }

    /// Whether every referenced tensor is present
    pub fn is_complete(&self) -> bool {
        self.missing_keys.is_empty()
    }

    /// Log the report; missing keys are warnings, the rest is debug output
    pub fn log_summary(&self) {
        debug!(
            "{}: {} tensors stored, {} referenced, {:.0}% found",
            self.artifact,
            self.available_keys.len(),
            self.expected_keys.len(),
            self.success_rate() * 100.0
        );

        for key in self.missing_keys.iter().take(10) {
            warn!("{}: missing tensor {}", self.artifact, key);
        }
        if self.missing_keys.len() > 10 {
            warn!("{}: ... and {} more missing", self.artifact, self.missing_keys.len() - 10);
        }
        if !self.extra_keys.is_empty() {
            debug!("{}: unreferenced tensors {:?}", self.artifact, self.extra_keys);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_partial_report() {
        let report = KeyReport::new("a.safetensors", keys(&["a", "b"]), keys(&["a", "b", "c"]));
        assert!(!report.is_complete());
        assert!((report.success_rate() - 0.666).abs() < 0.01);
        assert!(report.missing_keys.contains("c"));
        assert!(report.extra_keys.is_empty());
    }

    #[test]
    fn test_empty_expectation_is_complete() {
        let report = KeyReport::new("a.safetensors", keys(&["x"]), keys(&[]));
        assert!(report.is_complete());
        assert!((report.success_rate() - 1.0).abs() < 0.001);
        assert_eq!(report.extra_keys.len(), 1);
    }

    #[test]
    fn test_complete_report() {
        let report = KeyReport::new("a.safetensors", keys(&["w", "b", "x"]), keys(&["w", "b"]));
        assert!(report.is_complete());
        assert!(report.extra_keys.contains("x"));
    }
}
