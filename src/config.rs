//! Harness configuration
//!
//! Loaded from an optional YAML file; every field has a default, so an
//! empty file (or no file) reproduces the standard run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::debug::ToleranceConfig;

/// Which conversion/execution pair to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process loopback: the artifact is executed directly with candle-nn
    #[default]
    Builtin,
    /// External pnnx-style converter plus an external runner
    Pnnx,
}

/// An external program and its extra arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Program path or name on PATH
    pub program: PathBuf,
    /// Extra arguments appended to every invocation
    pub extra_args: Vec<String>,
}

impl ToolConfig {
    fn named(program: &str) -> Self {
        Self {
            program: PathBuf::from(program),
            extra_args: Vec::new(),
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self::named("")
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Test name; the artifact file is named after it
    pub test_name: String,
    /// Seed for parameters and inputs
    pub seed: u64,
    /// Directory receiving the artifact and converted files
    pub work_dir: PathBuf,
    /// Absolute tolerance
    pub atol: f64,
    /// Relative tolerance
    pub rtol: f64,
    /// Mismatches reported per case
    pub max_diffs: usize,
    /// Conversion/execution backend
    pub backend: Backend,
    /// External converter
    pub pnnx: ToolConfig,
    /// External runner for converted models
    pub runner: ToolConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let tolerance = ToleranceConfig::default();
        Self {
            test_name: "test_F_group_norm".to_string(),
            seed: 0,
            work_dir: PathBuf::from("."),
            atol: tolerance.atol,
            rtol: tolerance.rtol,
            max_diffs: tolerance.max_diffs,
            backend: Backend::default(),
            pnnx: ToolConfig::named("pnnx"),
            runner: ToolConfig::named("ncnn-runner"),
        }
    }
}

impl HarnessConfig {
    /// Load from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse config: {:?}", path))
    }

    /// Parse from YAML text; an empty document gives the defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the run meaningless
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.test_name.is_empty(), "test_name must not be empty");
        anyhow::ensure!(
            self.atol >= 0.0 && self.rtol >= 0.0,
            "tolerances must be non-negative (atol={}, rtol={})",
            self.atol,
            self.rtol
        );
        if self.backend == Backend::Pnnx {
            anyhow::ensure!(
                !self.pnnx.program.as_os_str().is_empty(),
                "pnnx backend needs pnnx.program"
            );
            anyhow::ensure!(
                !self.runner.program.as_os_str().is_empty(),
                "pnnx backend needs runner.program"
            );
        }
        Ok(())
    }

    /// Tolerance settings for the comparator
    pub fn tolerance(&self) -> ToleranceConfig {
        ToleranceConfig {
            atol: self.atol,
            rtol: self.rtol,
            max_diffs: self.max_diffs,
        }
    }

    /// Scratch directory for runner input/output tensors
    pub fn scratch_dir(&self) -> PathBuf {
        self.work_dir.join(format!("{}_io", self.test_name))
    }
}
