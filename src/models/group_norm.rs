//! Reference group normalization
//!
//! Ground truth for the conformance run. The formula is evaluated
//! directly in f64, without going through any library normalization layer:
//!
//! 1. Split the channels into `G` contiguous groups
//! 2. Per (batch, group), take mean and biased variance over the group's
//!    channels and all spatial positions
//! 3. `(x - mean) / sqrt(var + eps)`
//! 4. Per-channel affine: `y * weight[c] + bias[c]`

use anyhow::{ensure, Result};
use candle_core::{DType, Tensor};

use crate::cases::GroupNormCase;
use crate::utils::tensor_utils::channel_broadcast_shape;

/// Normalize `x` per group, without the affine step
///
/// Input is `[batch, channels, *spatial]`; output has the same shape and dtype.
pub fn group_norm_unscaled(x: &Tensor, num_groups: usize, eps: f64) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    ensure!(dims.len() >= 2, "group norm needs [batch, channels, ..], got {:?}", dims);
    let (batch, channels) = (dims[0], dims[1]);
    ensure!(
        num_groups > 0 && channels % num_groups == 0,
        "{} channels not divisible by {} groups",
        channels,
        num_groups
    );

    let group_len = dims[1..].iter().product::<usize>() / num_groups;
    let in_dtype = x.dtype();

    // (batch, groups, channels_per_group * spatial)
    let grouped = x.to_dtype(DType::F64)?.reshape((batch, num_groups, group_len))?;
    let mean = grouped.mean_keepdim(2)?;
    let centered = grouped.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(2)?;
    let std = var.affine(1.0, eps)?.sqrt()?;
    let normalized = centered.broadcast_div(&std)?;

    Ok(normalized.reshape(dims)?.to_dtype(in_dtype)?)
}

/// Full group normalization with per-channel affine parameters
pub fn group_norm(
    x: &Tensor,
    num_groups: usize,
    weight: &Tensor,
    bias: &Tensor,
    eps: f64,
) -> Result<Tensor> {
    let dims = x.dims();
    ensure!(dims.len() >= 2, "group norm needs [batch, channels, ..], got {:?}", dims);
    let channels = dims[1];
    ensure!(
        weight.dims() == [channels] && bias.dims() == [channels],
        "affine parameters must have {} elements, got weight {:?} bias {:?}",
        channels,
        weight.dims(),
        bias.dims()
    );

    let in_dtype = x.dtype();
    let normalized = group_norm_unscaled(x, num_groups, eps)?.to_dtype(DType::F64)?;

    let affine_shape = channel_broadcast_shape(dims.len(), channels);
    let w = weight.to_dtype(DType::F64)?.reshape(affine_shape.clone())?;
    let b = bias.to_dtype(DType::F64)?.reshape(affine_shape)?;

    let y = normalized.broadcast_mul(&w)?.broadcast_add(&b)?;
    Ok(y.to_dtype(in_dtype)?)
}

/// The reference model: one group normalization per case
///
/// Mirrors a traced graph with one input and one output per case, in case
/// order. Holds no mutable state, so repeated calls give identical output.
#[derive(Debug, Clone)]
pub struct GroupNormModel {
    cases: Vec<GroupNormCase>,
}

impl GroupNormModel {
    /// Wrap an ordered case list
    pub fn new(cases: Vec<GroupNormCase>) -> Self {
        Self { cases }
    }

    /// Cases in graph order
    pub fn cases(&self) -> &[GroupNormCase] {
        &self.cases
    }

    /// Number of graph inputs (and outputs)
    pub fn num_inputs(&self) -> usize {
        self.cases.len()
    }

    /// Declared input shapes, in graph order
    pub fn input_shapes(&self) -> Vec<Vec<usize>> {
        self.cases.iter().map(|c| c.input_shape().to_vec()).collect()
    }

    /// Evaluate a single case
    pub fn forward_case(&self, index: usize, x: &Tensor) -> Result<Tensor> {
        let case = self
            .cases
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("no case at index {}", index))?;
        ensure!(
            x.dims() == case.input_shape(),
            "case {} expects input {:?}, got {:?}",
            case.name(),
            case.input_shape(),
            x.dims()
        );
        group_norm(x, case.num_groups(), case.weight(), case.bias(), case.eps())
    }

    /// Evaluate every case; `inputs[i]` feeds case `i`
    pub fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        ensure!(
            inputs.len() == self.cases.len(),
            "model has {} inputs, got {}",
            self.cases.len(),
            inputs.len()
        );
        inputs
            .iter()
            .enumerate()
            .map(|(i, x)| self.forward_case(i, x))
            .collect()
    }
}
