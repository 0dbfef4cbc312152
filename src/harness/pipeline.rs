//! Conformance pipeline
//!
//! Runs the stages in a fixed order, with no retries:
//! 1. Build the cases and inputs from the seeded generator
//! 2. Compute the reference outputs
//! 3. Export the trace artifact
//! 4. Convert it with the declared input shapes
//! 5. Execute the converted model on the same inputs
//! 6. Compare and reduce to one verdict

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

use crate::adapters::{
    artifact_path, ArtifactExecutor, CommandExecutor, ConversionAdapter, ConvertedModel,
    ExecutionAdapter, ExportAdapter, LoopbackConverter, PnnxConverter, SafetensorsExporter,
};
use crate::cases::{build_cases, default_case_specs, random_inputs, CaseSpec};
use crate::config::{Backend, HarnessConfig};
use crate::debug::{Comparator, ComparisonReport};
use crate::error::ConformanceError;
use crate::models::GroupNormModel;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing done yet
    Start,
    /// Cases, inputs and reference outputs ready
    Configured,
    /// Trace artifact written
    Exported,
    /// Converted model available
    Converted,
    /// Engine outputs available
    Executed,
    /// Comparison finished
    Compared,
    /// Verdict delivered
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Start => "start",
            Stage::Configured => "configure",
            Stage::Exported => "export",
            Stage::Converted => "convert",
            Stage::Executed => "execute",
            Stage::Compared => "compare",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A fatal error, tagged with the stage that was being entered
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct StageError {
    /// Stage that did not complete
    pub stage: Stage,
    /// Underlying error
    #[source]
    pub source: ConformanceError,
}

/// Everything a finished run produced
#[derive(Debug)]
pub struct RunOutcome {
    /// Per-case and aggregate verdict
    pub report: ComparisonReport,
    /// Exported artifact
    pub artifact: PathBuf,
    /// Model handed to the engine
    pub converted: ConvertedModel,
}

impl RunOutcome {
    /// Whether every case passed
    pub fn passed(&self) -> bool {
        self.report.all_passed()
    }

    /// Process exit status: 0 pass, 1 fail
    pub fn exit_code(&self) -> i32 {
        self.report.exit_code()
    }
}

/// Drives one conformance run
pub struct ConformanceHarness {
    config: HarnessConfig,
    specs: Vec<CaseSpec>,
    device: Device,
    exporter: Box<dyn ExportAdapter>,
    converter: Box<dyn ConversionAdapter>,
    executor: Box<dyn ExecutionAdapter>,
    comparator: Comparator,
    stage: Stage,
}

impl ConformanceHarness {
    /// Harness with the adapters selected by `config.backend`
    pub fn new(config: HarnessConfig) -> Self {
        let exporter: Box<dyn ExportAdapter> = Box::new(SafetensorsExporter::new(&config.test_name));
        let (converter, executor): (Box<dyn ConversionAdapter>, Box<dyn ExecutionAdapter>) =
            match config.backend {
                Backend::Builtin => (
                    Box::new(LoopbackConverter),
                    Box::new(ArtifactExecutor::default()),
                ),
                Backend::Pnnx => (
                    Box::new(
                        PnnxConverter::new(&config.pnnx.program)
                            .with_args(config.pnnx.extra_args.clone()),
                    ),
                    Box::new(
                        CommandExecutor::new(&config.runner.program, config.scratch_dir())
                            .with_args(config.runner.extra_args.clone()),
                    ),
                ),
            };
        Self::with_adapters(config, exporter, converter, executor)
    }

    /// Harness with explicit adapters
    pub fn with_adapters(
        config: HarnessConfig,
        exporter: Box<dyn ExportAdapter>,
        converter: Box<dyn ConversionAdapter>,
        executor: Box<dyn ExecutionAdapter>,
    ) -> Self {
        let comparator = Comparator::new(config.tolerance());
        Self {
            config,
            specs: default_case_specs(),
            device: Device::Cpu,
            exporter,
            converter,
            executor,
            comparator,
            stage: Stage::Start,
        }
    }

    /// Replace the case list
    pub fn with_specs(mut self, specs: Vec<CaseSpec>) -> Self {
        self.specs = specs;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Last stage reached
    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self, to: Stage) {
        debug!("stage {} -> {}", self.stage, to);
        self.stage = to;
    }

    /// Run every stage once
    pub fn run(&mut self) -> Result<RunOutcome, StageError> {
        let fail = |stage: Stage| move |source: ConformanceError| StageError { stage, source };

        // Configure
        let (model, inputs, expected) = self.configure().map_err(fail(Stage::Configured))?;
        self.advance(Stage::Configured);

        // Export
        let path = artifact_path(&self.config.work_dir, &self.config.test_name);
        let artifact = self
            .exporter
            .export(&model, &inputs, &path)
            .map_err(fail(Stage::Exported))?;
        self.advance(Stage::Exported);

        // Convert
        let converted = self
            .converter
            .convert(&artifact.path, &model.input_shapes())
            .map_err(fail(Stage::Converted))?;
        info!("Converted model: {:?}", converted.files());
        self.advance(Stage::Converted);

        // Execute
        let actual = self
            .executor
            .execute(&converted, inputs.clone())
            .map_err(fail(Stage::Executed))?;
        if actual.len() != expected.len() {
            return Err(fail(Stage::Executed)(ConformanceError::Execution(format!(
                "engine returned {} outputs, graph declares {}",
                actual.len(),
                expected.len()
            ))));
        }
        self.advance(Stage::Executed);

        // Compare
        let names: Vec<&str> = model.cases().iter().map(|c| c.name()).collect();
        let report = self
            .comparator
            .compare_all(&names, &expected, &actual)
            .map_err(|e| ConformanceError::Evaluation(e.to_string()))
            .map_err(fail(Stage::Compared))?;
        self.advance(Stage::Compared);

        info!(
            "{}/{} cases passed",
            report.passed_count(),
            report.results().len()
        );
        self.advance(Stage::Done);

        Ok(RunOutcome {
            report,
            artifact: artifact.path,
            converted,
        })
    }

    /// Build cases, inputs and reference outputs from the seeded generator
    fn configure(&self) -> Result<(GroupNormModel, Vec<Tensor>, Vec<Tensor>), ConformanceError> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let cases = build_cases(&self.specs, &mut rng, &self.device)?;
        let inputs = random_inputs(&cases, &mut rng, &self.device)?;
        info!("Configured {} cases (seed {})", cases.len(), self.config.seed);

        let model = GroupNormModel::new(cases);
        let expected = model
            .forward(&inputs)
            .map_err(|e| ConformanceError::Evaluation(e.to_string()))?;
        Ok((model, inputs, expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Converted.to_string(), "convert");
        assert_eq!(Stage::Done.to_string(), "done");
    }

    #[test]
    fn test_builtin_run_passes() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig {
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut harness = ConformanceHarness::new(config);
        assert_eq!(harness.stage(), Stage::Start);

        let outcome = harness.run().unwrap();
        assert!(outcome.passed());
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.report.results().len(), 3);
        assert_eq!(harness.stage(), Stage::Done);
        assert_eq!(
            outcome.artifact,
            dir.path().join("test_F_group_norm.safetensors")
        );
    }

    #[test]
    fn test_bad_spec_fails_in_configure() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig {
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut harness = ConformanceHarness::new(config)
            .with_specs(vec![CaseSpec::new("bad", &[1, 10], 4)]);
        let err = harness.run().unwrap_err();
        assert_eq!(err.stage, Stage::Configured);
        assert!(matches!(err.source, ConformanceError::Configuration { .. }));
        assert_eq!(harness.stage(), Stage::Start);
    }

    #[test]
    fn test_missing_converter_fails_in_convert() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig {
            work_dir: dir.path().to_path_buf(),
            backend: Backend::Pnnx,
            ..Default::default()
        };
        config.pnnx.program = dir.path().join("no-such-pnnx");
        let mut harness = ConformanceHarness::new(config);
        let err = harness.run().unwrap_err();
        assert_eq!(err.stage, Stage::Converted);
        assert!(matches!(err.source, ConformanceError::Conversion { .. }));
        assert_eq!(harness.stage(), Stage::Exported);
    }
}
