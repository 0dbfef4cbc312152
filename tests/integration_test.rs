//! Integration tests for the conformance pipeline
//!
//! Runs the full pipeline with the builtin backend, with custom engines,
//! and with shell scripts standing in for the external converter and runner.

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::path::Path;

use groupnorm_conformance::adapters::{
    ArtifactExecutor, ConversionAdapter, ConvertedModel, ExecutionAdapter, LoopbackConverter,
    SafetensorsExporter, TraceArtifact,
};
use groupnorm_conformance::cases::{build_cases, default_case_specs, random_inputs, CaseSpec};
use groupnorm_conformance::error::ConformanceError;
use groupnorm_conformance::models::{group_norm, GroupNormModel};
use groupnorm_conformance::{Backend, ConformanceHarness, HarnessConfig, Stage, DEFAULT_EPS};

fn config_in(dir: &Path) -> HarnessConfig {
    HarnessConfig {
        work_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

/// Engine that runs the builtin executor and then nudges one element
struct PerturbingExecutor {
    output: usize,
    delta: f32,
}

impl ExecutionAdapter for PerturbingExecutor {
    fn execute(
        &self,
        model: &ConvertedModel,
        inputs: Vec<Tensor>,
    ) -> groupnorm_conformance::error::Result<Vec<Tensor>> {
        let mut outputs = ArtifactExecutor::default().execute(model, inputs)?;
        let target = &outputs[self.output];
        let dims = target.dims().to_vec();
        let mut data: Vec<f32> = target.flatten_all()?.to_vec1()?;
        data[0] += self.delta;
        outputs[self.output] = Tensor::from_vec(data, dims, &Device::Cpu)?;
        Ok(outputs)
    }
}

/// Engine that drops the last output
struct TruncatingExecutor;

impl ExecutionAdapter for TruncatingExecutor {
    fn execute(
        &self,
        model: &ConvertedModel,
        inputs: Vec<Tensor>,
    ) -> groupnorm_conformance::error::Result<Vec<Tensor>> {
        let mut outputs = ArtifactExecutor::default().execute(model, inputs)?;
        outputs.pop();
        Ok(outputs)
    }
}

fn harness_with_executor(dir: &Path, executor: Box<dyn ExecutionAdapter>) -> ConformanceHarness {
    let config = config_in(dir);
    let exporter = Box::new(SafetensorsExporter::new(&config.test_name));
    ConformanceHarness::with_adapters(config, exporter, Box::new(LoopbackConverter), executor)
}

/// The standard run passes end to end
#[test]
fn test_default_run_passes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let outcome = ConformanceHarness::new(config_in(dir.path())).run()?;

    assert!(outcome.passed());
    assert_eq!(outcome.exit_code(), 0);
    let shapes: Vec<Vec<usize>> = outcome
        .report
        .results()
        .iter()
        .map(|r| r.actual_shape.clone())
        .collect();
    assert_eq!(shapes, vec![vec![1, 16], vec![1, 12, 16], vec![1, 32, 12, 16]]);
    for result in outcome.report.results() {
        assert!(result.max_abs_diff < 1e-4, "{}", result.summary());
    }
    Ok(())
}

/// Two runs with the same seed reach the same numbers
#[test]
fn test_runs_are_reproducible() -> Result<()> {
    let a = tempfile::tempdir()?;
    let b = tempfile::tempdir()?;
    let first = ConformanceHarness::new(config_in(a.path())).run()?;
    let second = ConformanceHarness::new(config_in(b.path())).run()?;

    let device = Device::Cpu;
    let (graph_a, tensors_a) = TraceArtifact::load(&first.artifact, &device)?;
    let (graph_b, tensors_b) = TraceArtifact::load(&second.artifact, &device)?;
    assert_eq!(graph_a, graph_b);

    let mut keys: Vec<&String> = tensors_a.keys().collect();
    keys.sort();
    assert_eq!(keys.len(), tensors_b.len());
    for key in keys {
        let a = tensors_a[key].flatten_all()?.to_vec1::<f32>()?;
        let b = tensors_b[key].flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b, "tensor {} differs", key);
    }
    Ok(())
}

/// Per-channel grouping is a valid case and passes
#[test]
fn test_groups_equal_channels_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut harness = ConformanceHarness::new(config_in(dir.path()))
        .with_specs(vec![CaseSpec::new("per_channel", &[1, 8, 6], 8)]);
    let outcome = harness.run()?;
    assert!(outcome.passed());
    Ok(())
}

/// One element out of tolerance fails its case and the run, but is not an error
#[test]
fn test_single_element_mismatch_fails_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let executor = Box::new(PerturbingExecutor {
        output: 1,
        delta: 1e-2,
    });
    let mut harness = harness_with_executor(dir.path(), executor);
    let outcome = harness.run()?;

    assert!(!outcome.passed());
    assert_eq!(outcome.exit_code(), 1);
    let results = outcome.report.results();
    assert!(results[0].passed);
    assert!(!results[1].passed);
    assert_eq!(results[1].num_diffs, 1);
    assert_eq!(results[1].mismatches[0].index, 0);
    assert!(results[2].passed);
    assert_eq!(harness.stage(), Stage::Done);
    Ok(())
}

/// A perturbation below tolerance still passes
#[test]
fn test_mismatch_within_tolerance_passes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let executor = Box::new(PerturbingExecutor {
        output: 2,
        delta: 5e-5,
    });
    let outcome = harness_with_executor(dir.path(), executor).run()?;
    assert!(outcome.passed());
    Ok(())
}

/// Missing outputs are an execution error, not a verdict
#[test]
fn test_missing_output_is_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut harness = harness_with_executor(dir.path(), Box::new(TruncatingExecutor));
    let err = harness.run().unwrap_err();
    assert_eq!(err.stage, Stage::Executed);
    assert!(matches!(err.source, ConformanceError::Execution(_)));
    Ok(())
}

/// Declaring shapes that differ from the trace is a conversion error
#[test]
fn test_loopback_rejects_wrong_declared_shapes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let outcome = ConformanceHarness::new(config_in(dir.path())).run()?;

    let err = LoopbackConverter
        .convert(&outcome.artifact, &[vec![1, 16], vec![1, 12, 16]])
        .unwrap_err();
    assert!(matches!(err, ConformanceError::Conversion { .. }));
    assert!(err.to_string().contains("inputshape=[1,16],[1,12,16]"));
    Ok(())
}

/// The non-default epsilon case differs measurably from the default epsilon
#[test]
fn test_eps_override_is_honored() -> Result<()> {
    let device = Device::Cpu;
    let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(0);
    let cases = build_cases(&default_case_specs(), &mut rng, &device)?;
    let inputs = random_inputs(&cases, &mut rng, &device)?;
    let model = GroupNormModel::new(cases);
    let case = &model.cases()[2];
    assert_eq!(case.eps(), 1e-2);

    let honored = model.forward_case(2, &inputs[2])?;
    let default_eps = group_norm(&inputs[2], case.num_groups(), case.weight(), case.bias(), DEFAULT_EPS)?;
    let diff = (honored - default_eps)?.abs()?.flatten_all()?.max(0)?;
    assert!(diff.to_scalar::<f32>()? > 1e-3);
    Ok(())
}

#[cfg(unix)]
mod external_tools {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    /// Converter that records its arguments and writes empty outputs
    fn fake_pnnx(dir: &Path) -> Result<PathBuf> {
        write_script(
            dir,
            "fake-pnnx",
            r#"echo "$@" > "$(dirname "$1")/pnnx_args.txt"
base="${1%.*}"
echo 7767517 > "$base.ncnn.param"
: > "$base.ncnn.bin"
"#,
        )
    }

    /// Runner that copies every input to the matching output
    fn identity_runner(dir: &Path) -> Result<PathBuf> {
        write_script(
            dir,
            "identity-runner",
            r#"shift 2
files=""
while [ "$#" -gt 0 ] && [ "$1" != "--output-dir" ]; do files="$files $1"; shift; done
out="$2"
i=0
for f in $files; do cp "$f" "$out/out$i.npy"; i=$((i+1)); done
"#,
        )
    }

    fn pnnx_config(dir: &Path, pnnx: PathBuf, runner: PathBuf) -> HarnessConfig {
        let mut config = config_in(dir);
        config.backend = Backend::Pnnx;
        config.pnnx.program = pnnx;
        config.runner.program = runner;
        config
    }

    /// The converter sees the artifact and the declared shapes in input order
    #[test]
    fn test_converter_invocation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = pnnx_config(dir.path(), fake_pnnx(dir.path())?, identity_runner(dir.path())?);
        let outcome = ConformanceHarness::new(config).run()?;

        let args = std::fs::read_to_string(dir.path().join("pnnx_args.txt"))?;
        assert!(args.contains("test_F_group_norm.safetensors"));
        assert!(args.contains("inputshape=[1,16],[1,12,16],[1,32,12,16]"));
        assert_eq!(
            outcome.converted,
            ConvertedModel::Ncnn {
                param: dir.path().join("test_F_group_norm.ncnn.param"),
                bin: dir.path().join("test_F_group_norm.ncnn.bin"),
            }
        );
        Ok(())
    }

    /// An engine that returns its inputs is a clean fail verdict
    #[test]
    fn test_identity_runner_fails_comparison() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = pnnx_config(dir.path(), fake_pnnx(dir.path())?, identity_runner(dir.path())?);
        let outcome = ConformanceHarness::new(config).run()?;

        assert!(!outcome.passed());
        assert_eq!(outcome.exit_code(), 1);
        for result in outcome.report.results() {
            assert!(result.shape_match);
            assert!(result.num_diffs > 0);
        }
        Ok(())
    }

    /// A converter exiting non-zero is reported, not ignored
    #[test]
    fn test_failing_converter_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pnnx = write_script(dir.path(), "broken-pnnx", "echo 'load failed' >&2\nexit 1\n")?;
        let config = pnnx_config(dir.path(), pnnx, identity_runner(dir.path())?);
        let err = ConformanceHarness::new(config).run().unwrap_err();

        assert_eq!(err.stage, Stage::Converted);
        assert!(matches!(err.source, ConformanceError::Conversion { .. }));
        assert!(err.to_string().contains("load failed"));
        Ok(())
    }

    /// A converter that exits zero without writing anything is reported too
    #[test]
    fn test_silent_converter_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pnnx = write_script(dir.path(), "silent-pnnx", "exit 0\n")?;
        let config = pnnx_config(dir.path(), pnnx, identity_runner(dir.path())?);
        let err = ConformanceHarness::new(config).run().unwrap_err();

        assert_eq!(err.stage, Stage::Converted);
        assert!(err.to_string().contains("did not write"));
        Ok(())
    }

    /// A runner that crashes is an execution error
    #[test]
    fn test_failing_runner_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = write_script(dir.path(), "broken-runner", "exit 3\n")?;
        let config = pnnx_config(dir.path(), fake_pnnx(dir.path())?, runner);
        let err = ConformanceHarness::new(config).run().unwrap_err();

        assert_eq!(err.stage, Stage::Executed);
        assert!(matches!(err.source, ConformanceError::Execution(_)));
        Ok(())
    }
}

/// The binary maps verdicts and fatal errors to exit codes
#[test]
fn test_cli_exit_codes() -> Result<()> {
    let bin = env!("CARGO_BIN_EXE_groupnorm-conformance");
    let dir = tempfile::tempdir()?;

    let status = std::process::Command::new(bin)
        .arg("--work-dir")
        .arg(dir.path())
        .status()?;
    assert_eq!(status.code(), Some(0));

    let status = std::process::Command::new(bin)
        .arg("--work-dir")
        .arg(dir.path())
        .arg("--backend")
        .arg("pnnx")
        .arg("--pnnx")
        .arg(dir.path().join("no-such-pnnx"))
        .status()?;
    assert_eq!(status.code(), Some(2));
    Ok(())
}
