//! Conversion to the inference-engine representation
//!
//! The external converter is invoked as
//! `<program> <artifact> inputshape=[1,16],[1,12,16] [key=value ...]`
//! and writes `<base>.ncnn.param` / `<base>.ncnn.bin` next to the artifact,
//! where `<base>` is the artifact path without its extension and with `-`
//! replaced by `_` in the file name.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::adapters::export::TraceArtifact;
use crate::error::{ConformanceError, Result};
use crate::utils::shape_utils::format_shape_list;

/// A model ready for execution
#[derive(Debug, Clone, PartialEq)]
pub enum ConvertedModel {
    /// The trace artifact itself, for engines that read it directly
    Trace {
        /// Artifact path
        artifact: PathBuf,
    },
    /// ncnn param/bin pair produced by an external converter
    Ncnn {
        /// Graph structure
        param: PathBuf,
        /// Weights
        bin: PathBuf,
    },
}

impl ConvertedModel {
    /// Files making up the model, in the order runners expect them
    pub fn files(&self) -> Vec<&Path> {
        match self {
            Self::Trace { artifact } => vec![artifact.as_path()],
            Self::Ncnn { param, bin } => vec![param.as_path(), bin.as_path()],
        }
    }
}

/// Transforms a trace artifact into an engine-native model
pub trait ConversionAdapter {
    /// Convert `artifact`, declaring each graph input's shape in input order
    fn convert(&self, artifact: &Path, input_shapes: &[Vec<usize>]) -> Result<ConvertedModel>;
}

/// Output path prefix the converter derives from an artifact path
pub fn output_base(artifact: &Path) -> PathBuf {
    let stem = artifact
        .file_stem()
        .map(|s| s.to_string_lossy().replace('-', "_"))
        .unwrap_or_default();
    artifact.with_file_name(stem)
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    base.with_file_name(name)
}

/// Runs a pnnx-style converter as an external process
#[derive(Debug, Clone)]
pub struct PnnxConverter {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl PnnxConverter {
    /// Converter invoking `program`
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            extra_args: Vec::new(),
        }
    }

    /// Extra `key=value` arguments appended after `inputshape=`
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Arguments passed to the converter for an artifact
    pub fn arguments(&self, artifact: &Path, input_shapes: &[Vec<usize>]) -> Vec<String> {
        let mut args = vec![
            artifact.to_string_lossy().into_owned(),
            format!("inputshape={}", format_shape_list(input_shapes)),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Paths the converter is expected to write for an artifact
    pub fn expected_outputs(artifact: &Path) -> (PathBuf, PathBuf) {
        let base = output_base(artifact);
        (
            with_suffix(&base, ".ncnn.param"),
            with_suffix(&base, ".ncnn.bin"),
        )
    }
}

impl ConversionAdapter for PnnxConverter {
    fn convert(&self, artifact: &Path, input_shapes: &[Vec<usize>]) -> Result<ConvertedModel> {
        if !artifact.is_file() {
            return Err(ConformanceError::conversion(artifact, "artifact does not exist"));
        }

        let (param, bin) = Self::expected_outputs(artifact);
        // Leftovers from an earlier run would hide a converter that writes nothing
        for stale in [&param, &bin] {
            if stale.exists() {
                std::fs::remove_file(stale)?;
            }
        }

        let args = self.arguments(artifact, input_shapes);
        info!("Converting {:?} with {:?}", artifact, self.program);
        debug!("converter args: {:?}", args);

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| {
                ConformanceError::conversion(
                    artifact,
                    format!("failed to run {:?}: {}", self.program, e),
                )
            })?;

        for line in String::from_utf8_lossy(&output.stderr).lines() {
            debug!("converter: {}", line);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            return Err(ConformanceError::conversion(
                artifact,
                format!(
                    "{:?} exited with {}: {}",
                    self.program,
                    output.status,
                    tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
                ),
            ));
        }

        for expected in [&param, &bin] {
            if !expected.is_file() {
                return Err(ConformanceError::conversion(
                    artifact,
                    format!("converter succeeded but did not write {:?}", expected),
                ));
            }
        }

        Ok(ConvertedModel::Ncnn { param, bin })
    }
}

/// Hands the trace artifact straight to an engine that reads it natively
///
/// Still checks the declared shapes against the traced graph, so a shape
/// declaration error surfaces the same way an external converter's would.
#[derive(Debug, Clone, Default)]
pub struct LoopbackConverter;

impl ConversionAdapter for LoopbackConverter {
    fn convert(&self, artifact: &Path, input_shapes: &[Vec<usize>]) -> Result<ConvertedModel> {
        if !artifact.is_file() {
            return Err(ConformanceError::conversion(artifact, "artifact does not exist"));
        }

        let (graph, _) = TraceArtifact::load(artifact, &candle_core::Device::Cpu)
            .map_err(|e| ConformanceError::conversion(artifact, e.to_string()))?;
        let traced = graph.input_shapes();
        if traced != input_shapes {
            return Err(ConformanceError::conversion(
                artifact,
                format!(
                    "declared inputshape={} but graph was traced with {}",
                    format_shape_list(input_shapes),
                    format_shape_list(&traced)
                ),
            ));
        }

        info!("Loopback conversion of {:?}", artifact);
        Ok(ConvertedModel::Trace {
            artifact: artifact.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_base() {
        assert_eq!(
            output_base(Path::new("/w/test_F_group_norm.safetensors")),
            PathBuf::from("/w/test_F_group_norm")
        );
        assert_eq!(
            output_base(Path::new("/w/my-model.v2.pt")),
            PathBuf::from("/w/my_model.v2")
        );
        assert_eq!(output_base(Path::new("model")), PathBuf::from("model"));
    }

    #[test]
    fn test_expected_outputs() {
        let (param, bin) = PnnxConverter::expected_outputs(Path::new("/w/t.safetensors"));
        assert_eq!(param, PathBuf::from("/w/t.ncnn.param"));
        assert_eq!(bin, PathBuf::from("/w/t.ncnn.bin"));
    }

    #[test]
    fn test_arguments() {
        let converter = PnnxConverter::new("pnnx").with_args(vec!["fp16=0".to_string()]);
        let shapes = vec![vec![1, 16], vec![1, 12, 16], vec![1, 32, 12, 16]];
        let args = converter.arguments(Path::new("t.safetensors"), &shapes);
        assert_eq!(
            args,
            vec![
                "t.safetensors".to_string(),
                "inputshape=[1,16],[1,12,16],[1,32,12,16]".to_string(),
                "fp16=0".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_artifact_is_conversion_error() {
        let err = PnnxConverter::new("pnnx")
            .convert(Path::new("/nonexistent/x.safetensors"), &[])
            .unwrap_err();
        assert!(matches!(err, ConformanceError::Conversion { .. }));
    }

    #[test]
    fn test_unspawnable_program_is_conversion_error() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.safetensors");
        std::fs::write(&artifact, b"x").unwrap();
        let err = PnnxConverter::new(dir.path().join("no-such-converter"))
            .convert(&artifact, &[vec![1, 4]])
            .unwrap_err();
        assert!(matches!(err, ConformanceError::Conversion { .. }));
        assert!(err.to_string().contains("failed to run"));
    }

    #[test]
    fn test_model_files() {
        let m = ConvertedModel::Ncnn {
            param: PathBuf::from("a.param"),
            bin: PathBuf::from("a.bin"),
        };
        assert_eq!(m.files(), vec![Path::new("a.param"), Path::new("a.bin")]);
    }
}
