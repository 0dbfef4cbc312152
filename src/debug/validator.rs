//! Tolerance comparison between reference and converted outputs
//!
//! An element passes when `|a - b| <= atol + rtol * |b|`, where `a` is the
//! reference value and `b` the converted one. A case passes when every
//! element passes; the run passes when every case passes.

use anyhow::{ensure, Result};
use candle_core::{DType, Tensor};
use tracing::{debug, warn};

/// Tolerance configuration
#[derive(Debug, Clone)]
pub struct ToleranceConfig {
    /// Absolute tolerance
    pub atol: f64,
    /// Relative tolerance, scaled by the converted value
    pub rtol: f64,
    /// Maximum number of mismatches kept per case for diagnostics
    pub max_diffs: usize,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            atol: 1e-4,
            rtol: 1e-4,
            max_diffs: 10,
        }
    }
}

/// Elementwise closeness test
///
/// Exactly equal values (including equal infinities) always pass; NaN on
/// either side never passes.
pub fn is_close(expected: f64, actual: f64, atol: f64, rtol: f64) -> bool {
    if expected == actual {
        return true;
    }
    let diff = (expected - actual).abs();
    diff <= atol + rtol * actual.abs()
}

/// One element outside tolerance
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    /// Flat row-major index
    pub index: usize,
    /// Reference value
    pub expected: f32,
    /// Converted value
    pub actual: f32,
    /// Absolute difference
    pub diff: f32,
}

/// Result of comparing one case
#[derive(Debug, Clone)]
pub struct CaseComparison {
    /// Case name
    pub name: String,
    /// Whether the case passed
    pub passed: bool,
    /// Shape matches
    pub shape_match: bool,
    /// Reference shape
    pub expected_shape: Vec<usize>,
    /// Converted shape
    pub actual_shape: Vec<usize>,
    /// Maximum absolute difference
    pub max_abs_diff: f32,
    /// Mean absolute difference
    pub mean_abs_diff: f32,
    /// Number of elements beyond tolerance
    pub num_diffs: usize,
    /// Total number of elements
    pub total_elements: usize,
    /// First mismatches, capped by [`ToleranceConfig::max_diffs`]
    pub mismatches: Vec<Mismatch>,
}

impl CaseComparison {
    /// Summary string
    pub fn summary(&self) -> String {
        if self.passed {
            format!(
                "[PASS] {} - shape {:?}, max_diff={:.2e}, mean_diff={:.2e}",
                self.name, self.actual_shape, self.max_abs_diff, self.mean_abs_diff
            )
        } else if !self.shape_match {
            format!(
                "[FAIL] {} - shape mismatch: expected {:?}, got {:?}",
                self.name, self.expected_shape, self.actual_shape
            )
        } else {
            format!(
                "[FAIL] {} - {} of {} elements beyond tolerance, max_diff={:.2e}",
                self.name, self.num_diffs, self.total_elements, self.max_abs_diff
            )
        }
    }
}

/// Aggregate verdict over all cases
#[derive(Debug, Clone, Default)]
pub struct ComparisonReport {
    results: Vec<CaseComparison>,
}

impl ComparisonReport {
    /// Per-case results, in graph order
    pub fn results(&self) -> &[CaseComparison] {
        &self.results
    }

    /// Logical AND over all cases
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Number of passing cases
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    /// Process exit status for this verdict: 0 pass, 1 fail
    pub fn exit_code(&self) -> i32 {
        if self.all_passed() {
            0
        } else {
            1
        }
    }

    /// Print summary
    pub fn print_summary(&self) {
        println!("\n=== Conformance Summary ===\n");

        for result in &self.results {
            println!("{}", result.summary());
        }

        let passed = self.passed_count();
        let total = self.results.len();
        println!("\nTotal: {}/{} passed", passed, total);

        if passed == total {
            println!("✓ All cases passed!");
        } else {
            println!("✗ {} case(s) failed", total - passed);
        }
    }
}

/// Compares reference outputs to converted outputs
pub struct Comparator {
    config: ToleranceConfig,
}

impl Default for Comparator {
    fn default() -> Self {
        Self::new(ToleranceConfig::default())
    }
}

impl Comparator {
    /// Create with a tolerance config
    pub fn new(config: ToleranceConfig) -> Self {
        Self { config }
    }

    /// Tolerance in use
    pub fn config(&self) -> &ToleranceConfig {
        &self.config
    }

    /// Compare one reference output with one converted output
    pub fn compare(&self, name: &str, expected: &Tensor, actual: &Tensor) -> Result<CaseComparison> {
        let expected_shape = expected.dims().to_vec();
        let actual_shape = actual.dims().to_vec();

        if expected_shape != actual_shape {
            warn!(
                "{}: shape mismatch, expected {:?}, got {:?}",
                name, expected_shape, actual_shape
            );
            return Ok(CaseComparison {
                name: name.to_string(),
                passed: false,
                shape_match: false,
                total_elements: expected.elem_count(),
                expected_shape,
                actual_shape,
                max_abs_diff: f32::INFINITY,
                mean_abs_diff: f32::INFINITY,
                num_diffs: 0,
                mismatches: Vec::new(),
            });
        }

        let expected_data: Vec<f32> = expected.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let actual_data: Vec<f32> = actual.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

        let (max_abs_diff, mean_abs_diff, num_diffs, mismatches) =
            self.compare_values(&expected_data, &actual_data);

        for m in &mismatches {
            warn!(
                "{}: [{}] expected={:.6}, actual={:.6}, diff={:.2e}",
                name, m.index, m.expected, m.actual, m.diff
            );
        }
        if num_diffs > mismatches.len() {
            warn!("{}: ... and {} more", name, num_diffs - mismatches.len());
        }

        let result = CaseComparison {
            name: name.to_string(),
            passed: num_diffs == 0,
            shape_match: true,
            expected_shape,
            actual_shape,
            max_abs_diff,
            mean_abs_diff,
            num_diffs,
            total_elements: expected_data.len(),
            mismatches,
        };
        debug!("{}", result.summary());
        Ok(result)
    }

    /// Compare every case pairwise; `names`, `expected` and `actual` line up
    pub fn compare_all(
        &self,
        names: &[&str],
        expected: &[Tensor],
        actual: &[Tensor],
    ) -> Result<ComparisonReport> {
        ensure!(
            names.len() == expected.len() && expected.len() == actual.len(),
            "{} names, {} reference outputs, {} converted outputs",
            names.len(),
            expected.len(),
            actual.len()
        );

        let results = names
            .iter()
            .zip(expected.iter().zip(actual.iter()))
            .map(|(name, (e, a))| self.compare(name, e, a))
            .collect::<Result<Vec<_>>>()?;

        Ok(ComparisonReport { results })
    }

    /// Compare float values with tolerance
    fn compare_values(&self, expected: &[f32], actual: &[f32]) -> (f32, f32, usize, Vec<Mismatch>) {
        let mut max_diff = 0.0f32;
        let mut sum_diff = 0.0f64;
        let mut num_diffs = 0;
        let mut mismatches = Vec::new();

        for (i, (&e, &a)) in expected.iter().zip(actual.iter()).enumerate() {
            let diff = if e == a { 0.0 } else { (e - a).abs() };
            // once NaN, the max stays NaN
            if diff.is_nan() || max_diff.is_nan() {
                max_diff = f32::NAN;
            } else {
                max_diff = max_diff.max(diff);
            }
            sum_diff += diff as f64;

            if !is_close(e as f64, a as f64, self.config.atol, self.config.rtol) {
                num_diffs += 1;
                if mismatches.len() < self.config.max_diffs {
                    mismatches.push(Mismatch {
                        index: i,
                        expected: e,
                        actual: a,
                        diff,
                    });
                }
            }
        }

        let mean_diff = (sum_diff / expected.len().max(1) as f64) as f32;
        (max_diff, mean_diff, num_diffs, mismatches)
    }
}
