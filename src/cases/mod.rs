//! Group normalization cases under test
//!
//! A case is one parameterized instance of the operator: input shape,
//! group count, epsilon and the per-channel affine parameters. The static
//! part lives in [`CaseSpec`]; [`build_cases`] validates it and draws the
//! parameters from an explicitly passed generator.

use candle_core::{Device, Tensor};
use rand::Rng;
use tracing::debug;

use crate::error::{ConformanceError, Result};
use crate::utils::tensor_utils::uniform_tensor;

/// Default epsilon of the group normalization operator
pub const DEFAULT_EPS: f64 = 1e-5;

/// Static description of a case
#[derive(Debug, Clone, PartialEq)]
pub struct CaseSpec {
    /// Case name, also used as the graph node name
    pub name: String,
    /// Full input shape `[batch, channels, *spatial]`
    pub input_shape: Vec<usize>,
    /// Number of channel groups
    pub num_groups: usize,
    /// Epsilon added to the variance
    pub eps: f64,
}

impl CaseSpec {
    /// Case with the default epsilon
    pub fn new(name: &str, input_shape: &[usize], num_groups: usize) -> Self {
        Self {
            name: name.to_string(),
            input_shape: input_shape.to_vec(),
            num_groups,
            eps: DEFAULT_EPS,
        }
    }

    /// Override epsilon
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Input rank
    pub fn rank(&self) -> usize {
        self.input_shape.len()
    }

    /// Channel count, zero for shapes too short to carry one
    pub fn num_channels(&self) -> usize {
        self.input_shape.get(1).copied().unwrap_or(0)
    }

    /// Check the construction invariants
    pub fn validate(&self) -> Result<()> {
        if self.rank() < 2 {
            return Err(ConformanceError::configuration(
                &self.name,
                format!("input shape {:?} has no channel dimension", self.input_shape),
            ));
        }
        if self.input_shape[0] != 1 {
            return Err(ConformanceError::configuration(
                &self.name,
                format!("batch dimension must be 1, got {}", self.input_shape[0]),
            ));
        }
        if self.input_shape.contains(&0) {
            return Err(ConformanceError::configuration(
                &self.name,
                format!("input shape {:?} has an empty dimension", self.input_shape),
            ));
        }
        let channels = self.num_channels();
        if self.num_groups == 0 || channels % self.num_groups != 0 {
            return Err(ConformanceError::configuration(
                &self.name,
                format!(
                    "{} channels not divisible by {} groups",
                    channels, self.num_groups
                ),
            ));
        }
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(ConformanceError::configuration(
                &self.name,
                format!("epsilon must be positive, got {}", self.eps),
            ));
        }
        Ok(())
    }
}

/// The fixed, ordered case list exercised by a default run
pub fn default_case_specs() -> Vec<CaseSpec> {
    vec![
        CaseSpec::new("gn_rank2", &[1, 16], 4),
        CaseSpec::new("gn_rank3", &[1, 12, 16], 6),
        CaseSpec::new("gn_rank4", &[1, 32, 12, 16], 8).with_eps(1e-2),
    ]
}

/// A validated case with its affine parameters
#[derive(Debug, Clone)]
pub struct GroupNormCase {
    spec: CaseSpec,
    weight: Tensor,
    bias: Tensor,
}

impl GroupNormCase {
    /// Build a case from explicit parameters
    pub fn new(spec: CaseSpec, weight: Tensor, bias: Tensor) -> Result<Self> {
        spec.validate()?;
        let channels = spec.num_channels();
        for (label, t) in [("weight", &weight), ("bias", &bias)] {
            if t.dims() != [channels] {
                return Err(ConformanceError::configuration(
                    &spec.name,
                    format!("{} has shape {:?}, expected [{}]", label, t.dims(), channels),
                ));
            }
        }
        Ok(Self { spec, weight, bias })
    }

    /// Build a case whose parameters are drawn uniform [0, 1), weight then bias
    pub fn random<R: Rng + ?Sized>(spec: CaseSpec, rng: &mut R, device: &Device) -> Result<Self> {
        spec.validate()?;
        let channels = spec.num_channels();
        let weight = uniform_tensor(&[channels], rng, device)?;
        let bias = uniform_tensor(&[channels], rng, device)?;
        Self::new(spec, weight, bias)
    }

    /// Build a case with weight 1 and bias 0
    pub fn identity_affine(spec: CaseSpec, device: &Device) -> Result<Self> {
        let channels = spec.num_channels();
        let weight = Tensor::ones(channels, candle_core::DType::F32, device)?;
        let bias = Tensor::zeros(channels, candle_core::DType::F32, device)?;
        Self::new(spec, weight, bias)
    }

    /// Case name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Input shape
    pub fn input_shape(&self) -> &[usize] {
        &self.spec.input_shape
    }

    /// Channel count
    pub fn num_channels(&self) -> usize {
        self.spec.num_channels()
    }

    /// Group count
    pub fn num_groups(&self) -> usize {
        self.spec.num_groups
    }

    /// Epsilon
    pub fn eps(&self) -> f64 {
        self.spec.eps
    }

    /// Per-channel scale
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Per-channel shift
    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Draw a random input of this case's shape
    pub fn random_input<R: Rng + ?Sized>(&self, rng: &mut R, device: &Device) -> Result<Tensor> {
        Ok(uniform_tensor(self.input_shape(), rng, device)?)
    }
}

/// Validate every spec and draw its parameters, in order
pub fn build_cases<R: Rng + ?Sized>(
    specs: &[CaseSpec],
    rng: &mut R,
    device: &Device,
) -> Result<Vec<GroupNormCase>> {
    specs
        .iter()
        .map(|spec| {
            let case = GroupNormCase::random(spec.clone(), rng, device)?;
            debug!(
                "case {}: shape {:?}, {} groups, eps {:e}",
                case.name(),
                case.input_shape(),
                case.num_groups(),
                case.eps()
            );
            Ok(case)
        })
        .collect()
}

/// Draw one input per case, in case order
pub fn random_inputs<R: Rng + ?Sized>(
    cases: &[GroupNormCase],
    rng: &mut R,
    device: &Device,
) -> Result<Vec<Tensor>> {
    cases.iter().map(|c| c.random_input(rng, device)).collect()
}
