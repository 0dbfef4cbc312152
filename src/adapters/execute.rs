//! Execution of converted models
//!
//! Two engines ship with the crate:
//! - [`ArtifactExecutor`] interprets the trace graph in-process with
//!   candle-nn's `GroupNorm`, an implementation independent of the
//!   reference formula
//! - [`CommandExecutor`] hands the model files and `.npy` inputs to an
//!   external runner and reads `out0.npy`, `out1.npy`, ... back

use candle_core::{Device, Tensor};
use candle_nn::{GroupNorm, Module};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::adapters::convert::ConvertedModel;
use crate::adapters::export::{TraceArtifact, TraceNode, GROUP_NORM_OP};
use crate::debug::{load_npy_tensor, save_npy_tensor, KeyReport};
use crate::error::{ConformanceError, Result};

/// Runs a converted model
pub trait ExecutionAdapter {
    /// Execute `model` on `inputs` (graph input order); returns one tensor
    /// per graph output, in graph output order
    fn execute(&self, model: &ConvertedModel, inputs: Vec<Tensor>) -> Result<Vec<Tensor>>;
}

/// In-process engine for trace artifacts
#[derive(Debug, Clone)]
pub struct ArtifactExecutor {
    device: Device,
}

impl Default for ArtifactExecutor {
    fn default() -> Self {
        Self::new(Device::Cpu)
    }
}

impl ArtifactExecutor {
    /// Engine running on `device`
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    fn run_node(&self, node: &TraceNode, x: &Tensor, tensors: &HashMap<String, Tensor>) -> Result<Tensor> {
        if node.op != GROUP_NORM_OP {
            return Err(ConformanceError::Execution(format!(
                "node {}: unsupported op {}",
                node.name, node.op
            )));
        }
        let dims = x.dims().to_vec();
        if dims.len() < 2 {
            return Err(ConformanceError::Execution(format!(
                "node {}: input rank {} has no channel dimension",
                node.name,
                dims.len()
            )));
        }

        let param = |key: &str| {
            tensors.get(key).cloned().ok_or_else(|| {
                ConformanceError::Execution(format!("node {}: missing tensor {}", node.name, key))
            })
        };
        let weight = param(&node.weight)?;
        let bias = param(&node.bias)?;
        let layer = GroupNorm::new(weight, bias, dims[1], node.num_groups, node.eps)?;

        // candle's GroupNorm wants at least one spatial dimension
        if dims.len() == 2 {
            let y = layer.forward(&x.unsqueeze(2)?)?;
            Ok(y.squeeze(2)?)
        } else {
            Ok(layer.forward(x)?)
        }
    }
}

impl ExecutionAdapter for ArtifactExecutor {
    fn execute(&self, model: &ConvertedModel, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let artifact = match model {
            ConvertedModel::Trace { artifact } => artifact,
            other => {
                return Err(ConformanceError::Execution(format!(
                    "in-process engine reads trace artifacts only, got {:?}",
                    other
                )))
            }
        };

        let (graph, tensors) = TraceArtifact::load(artifact, &self.device)?;

        let report = KeyReport::new(
            &artifact.to_string_lossy(),
            tensors.keys().cloned(),
            graph.parameter_keys(),
        );
        report.log_summary();
        if !report.is_complete() {
            return Err(ConformanceError::Execution(format!(
                "{:?} is missing tensors {:?}",
                artifact, report.missing_keys
            )));
        }

        if inputs.len() != graph.inputs.len() {
            return Err(ConformanceError::Execution(format!(
                "graph has {} inputs, got {}",
                graph.inputs.len(),
                inputs.len()
            )));
        }

        let mut values: HashMap<String, Tensor> = HashMap::new();
        for (decl, x) in graph.inputs.iter().zip(inputs) {
            if x.dims() != decl.shape.as_slice() {
                return Err(ConformanceError::Execution(format!(
                    "input {} declared {:?}, got {:?}",
                    decl.name,
                    decl.shape,
                    x.dims()
                )));
            }
            values.insert(decl.name.clone(), x.to_device(&self.device)?);
        }

        for node in &graph.nodes {
            let x = values.get(&node.input).ok_or_else(|| {
                ConformanceError::Execution(format!("node {}: undefined input {}", node.name, node.input))
            })?;
            let y = self.run_node(node, x, &tensors)?;
            debug!("node {} -> {} {:?}", node.name, node.output, y.dims());
            values.insert(node.output.clone(), y);
        }

        graph
            .outputs
            .iter()
            .map(|name| {
                values
                    .remove(name)
                    .ok_or_else(|| ConformanceError::Execution(format!("output {} never produced", name)))
            })
            .collect()
    }
}

/// External runner protocol
///
/// The runner is called as
/// `<program> <model files...> <in0.npy> ... --output-dir <dir> [extra args]`
/// and must write one `out<i>.npy` per graph output into `<dir>`.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    extra_args: Vec<String>,
    scratch_dir: PathBuf,
    device: Device,
}

impl CommandExecutor {
    /// Runner invoking `program`, exchanging tensors through `scratch_dir`
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(program: P, scratch_dir: Q) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            extra_args: Vec::new(),
            scratch_dir: scratch_dir.as_ref().to_path_buf(),
            device: Device::Cpu,
        }
    }

    /// Extra arguments appended to every invocation
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn output_path(&self, index: usize) -> PathBuf {
        self.scratch_dir.join(format!("out{}.npy", index))
    }

    fn clear_outputs(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.scratch_dir)? {
            let path = entry?.path();
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if name.starts_with("out") && name.ends_with(".npy") {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

impl ExecutionAdapter for CommandExecutor {
    fn execute(&self, model: &ConvertedModel, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        self.clear_outputs()?;

        let mut input_paths = Vec::with_capacity(inputs.len());
        for (i, x) in inputs.into_iter().enumerate() {
            let path = self.scratch_dir.join(format!("in{}.npy", i));
            save_npy_tensor(&path, &x).map_err(|e| ConformanceError::Execution(e.to_string()))?;
            input_paths.push(path);
        }

        info!("Running {:?} on {} inputs", self.program, input_paths.len());
        let output = Command::new(&self.program)
            .args(model.files())
            .args(&input_paths)
            .arg("--output-dir")
            .arg(&self.scratch_dir)
            .args(&self.extra_args)
            .output()
            .map_err(|e| ConformanceError::Execution(format!("failed to run {:?}: {}", self.program, e)))?;

        for line in String::from_utf8_lossy(&output.stderr).lines() {
            debug!("runner: {}", line);
        }
        if !output.status.success() {
            return Err(ConformanceError::Execution(format!(
                "{:?} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut outputs = Vec::new();
        loop {
            let path = self.output_path(outputs.len());
            if !path.is_file() {
                break;
            }
            let y = load_npy_tensor(&path, &self.device)
                .map_err(|e| ConformanceError::Execution(format!("{:?}: {}", path, e)))?;
            outputs.push(y);
        }
        debug!("runner produced {} outputs", outputs.len());
        Ok(outputs)
    }
}
