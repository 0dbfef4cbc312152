//! Boundaries to the export, conversion and execution collaborators
//!
//! - Export: reference model to a portable trace artifact
//! - Conversion: trace artifact to an engine-native model
//! - Execution: engine-native model to output tensors
//!
//! The harness only sees the traits; concrete adapters are picked from
//! the configured backend.

pub mod convert;
pub mod execute;
pub mod export;

pub use convert::{output_base, ConversionAdapter, ConvertedModel, LoopbackConverter, PnnxConverter};
pub use execute::{ArtifactExecutor, CommandExecutor, ExecutionAdapter};
pub use export::{
    artifact_path, ExportAdapter, SafetensorsExporter, TraceArtifact, TraceGraph, TraceInput,
    TraceNode,
};
