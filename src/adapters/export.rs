//! Trace export
//!
//! Serializes the reference model into one portable artifact: a safetensors
//! file holding every affine parameter and the representative inputs, with
//! the graph itself stored as JSON under the `trace_graph` metadata key.

use candle_core::{DType, Device, Tensor};
use safetensors::tensor::{serialize_to_file, TensorView};
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ConformanceError, Result};
use crate::models::GroupNormModel;

/// Metadata key holding the serialized graph
pub const GRAPH_METADATA_KEY: &str = "trace_graph";

/// Operator name recorded for group normalization nodes
pub const GROUP_NORM_OP: &str = "F.group_norm";

/// Artifact file extension
pub const ARTIFACT_EXTENSION: &str = "safetensors";

/// Graph format version written by this exporter
pub const GRAPH_VERSION: u32 = 1;

/// A declared graph input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceInput {
    /// Input name, referenced by nodes
    pub name: String,
    /// Declared shape
    pub shape: Vec<usize>,
}

/// One operator in the traced graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceNode {
    /// Node name
    pub name: String,
    /// Operator type
    pub op: String,
    /// Input value name
    pub input: String,
    /// Output value name
    pub output: String,
    /// Number of channel groups
    pub num_groups: usize,
    /// Variance epsilon
    pub eps: f64,
    /// Tensor key of the per-channel weight
    pub weight: String,
    /// Tensor key of the per-channel bias
    pub bias: String,
}

/// The traced graph: inputs, nodes and outputs in declaration order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceGraph {
    /// Format version
    pub version: u32,
    /// Graph name
    pub name: String,
    /// Inputs, in declaration order
    pub inputs: Vec<TraceInput>,
    /// Nodes, in execution order
    pub nodes: Vec<TraceNode>,
    /// Output value names, in declaration order
    pub outputs: Vec<String>,
}

impl TraceGraph {
    /// Trace the reference model: one input, node and output per case
    pub fn from_model(name: &str, model: &GroupNormModel) -> Self {
        let mut inputs = Vec::new();
        let mut nodes = Vec::new();
        let mut outputs = Vec::new();

        for (i, case) in model.cases().iter().enumerate() {
            let input = format!("in{}", i);
            let output = format!("out{}", i);
            inputs.push(TraceInput {
                name: input.clone(),
                shape: case.input_shape().to_vec(),
            });
            nodes.push(TraceNode {
                name: case.name().to_string(),
                op: GROUP_NORM_OP.to_string(),
                input,
                output: output.clone(),
                num_groups: case.num_groups(),
                eps: case.eps(),
                weight: format!("{}.weight", case.name()),
                bias: format!("{}.bias", case.name()),
            });
            outputs.push(output);
        }

        Self {
            version: GRAPH_VERSION,
            name: name.to_string(),
            inputs,
            nodes,
            outputs,
        }
    }

    /// Declared input shapes, in input order
    pub fn input_shapes(&self) -> Vec<Vec<usize>> {
        self.inputs.iter().map(|i| i.shape.clone()).collect()
    }

    /// Every tensor key the nodes reference
    pub fn parameter_keys(&self) -> Vec<String> {
        self.nodes
            .iter()
            .flat_map(|n| [n.weight.clone(), n.bias.clone()])
            .collect()
    }
}

/// Key under which the representative value of an input is stored
pub fn example_input_key(input_name: &str) -> String {
    format!("example.{}", input_name)
}

/// Artifact path for a test name: `<work_dir>/<test_name>.safetensors`
pub fn artifact_path(work_dir: &Path, test_name: &str) -> PathBuf {
    work_dir.join(format!("{}.{}", test_name, ARTIFACT_EXTENSION))
}

/// An exported artifact
#[derive(Debug, Clone)]
pub struct TraceArtifact {
    /// File on disk
    pub path: PathBuf,
    /// Graph stored in it
    pub graph: TraceGraph,
}

impl TraceArtifact {
    /// Read graph and tensors back from disk
    pub fn load(path: &Path, device: &Device) -> Result<(TraceGraph, HashMap<String, Tensor>)> {
        let buffer = std::fs::read(path)?;
        let invalid = |reason: String| ConformanceError::Execution(format!("{:?}: {}", path, reason));

        let (_, metadata) =
            SafeTensors::read_metadata(&buffer).map_err(|e| invalid(e.to_string()))?;
        let graph_json = metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(GRAPH_METADATA_KEY))
            .ok_or_else(|| invalid(format!("no `{}` metadata", GRAPH_METADATA_KEY)))?;
        let graph: TraceGraph =
            serde_json::from_str(graph_json).map_err(|e| invalid(e.to_string()))?;

        let st = SafeTensors::deserialize(&buffer).map_err(|e| invalid(e.to_string()))?;
        let mut tensors = HashMap::new();
        for (name, view) in st.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(invalid(format!("tensor {} has dtype {:?}", name, view.dtype())));
            }
            let data: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            tensors.insert(name, Tensor::from_vec(data, view.shape(), device)?);
        }

        Ok((graph, tensors))
    }
}

/// Serializes a reference model into a portable trace artifact
pub trait ExportAdapter {
    /// Write the artifact for `model`, traced with one representative input per case
    fn export(&self, model: &GroupNormModel, inputs: &[Tensor], path: &Path) -> Result<TraceArtifact>;
}

/// Writes the trace as a single safetensors file
#[derive(Debug, Clone)]
pub struct SafetensorsExporter {
    graph_name: String,
}

impl SafetensorsExporter {
    /// Exporter naming the graph after the test
    pub fn new(graph_name: &str) -> Self {
        Self {
            graph_name: graph_name.to_string(),
        }
    }
}

impl ExportAdapter for SafetensorsExporter {
    fn export(&self, model: &GroupNormModel, inputs: &[Tensor], path: &Path) -> Result<TraceArtifact> {
        let export_err = |reason: String| ConformanceError::Export {
            path: path.to_path_buf(),
            reason,
        };

        if inputs.len() != model.num_inputs() {
            return Err(export_err(format!(
                "model has {} inputs, traced with {}",
                model.num_inputs(),
                inputs.len()
            )));
        }
        for (case, x) in model.cases().iter().zip(inputs) {
            if x.dims() != case.input_shape() {
                return Err(export_err(format!(
                    "{} declared {:?}, traced with {:?}",
                    case.name(),
                    case.input_shape(),
                    x.dims()
                )));
            }
        }

        let graph = TraceGraph::from_model(&self.graph_name, model);

        // (key, shape, little-endian f32 bytes)
        let mut storage: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        for (case, node) in model.cases().iter().zip(&graph.nodes) {
            storage.push(tensor_bytes(&node.weight, case.weight())?);
            storage.push(tensor_bytes(&node.bias, case.bias())?);
        }
        for (input, x) in graph.inputs.iter().zip(inputs) {
            storage.push(tensor_bytes(&example_input_key(&input.name), x)?);
        }

        let views = storage
            .iter()
            .map(|(key, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes)
                    .map(|view| (key.clone(), view))
                    .map_err(|e| export_err(format!("tensor {}: {}", key, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let graph_json = serde_json::to_string(&graph).map_err(|e| export_err(e.to_string()))?;
        let mut metadata = HashMap::new();
        metadata.insert(GRAPH_METADATA_KEY.to_string(), graph_json);
        metadata.insert("format".to_string(), "trace".to_string());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        serialize_to_file(views, Some(metadata), path).map_err(|e| export_err(e.to_string()))?;

        info!("Exported {} nodes to {:?}", graph.nodes.len(), path);
        debug!("graph inputs: {:?}", graph.input_shapes());

        Ok(TraceArtifact {
            path: path.to_path_buf(),
            graph,
        })
    }
}

fn tensor_bytes(key: &str, t: &Tensor) -> Result<(String, Vec<usize>, Vec<u8>)> {
    let data: Vec<f32> = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    Ok((key.to_string(), t.dims().to_vec(), bytes))
}
