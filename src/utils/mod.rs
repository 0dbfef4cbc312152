//! Utility functions and helpers
//!
//! This module provides common utilities used across the crate.

/// Tensor utilities
pub mod tensor_utils {
    use candle_core::{Device, Result, Tensor};
    use rand::Rng;

    /// Draw a tensor of uniform [0, 1) f32 values from an explicit generator
    ///
    /// Values are drawn in row-major order, so the same generator state
    /// always yields the same tensor.
    pub fn uniform_tensor<R: Rng + ?Sized>(
        shape: &[usize],
        rng: &mut R,
        device: &Device,
    ) -> Result<Tensor> {
        let numel: usize = shape.iter().product();
        let data: Vec<f32> = (0..numel).map(|_| rng.gen::<f32>()).collect();
        Tensor::from_vec(data, shape, device)
    }

    /// Shape that broadcasts a per-channel vector against an NC* tensor
    ///
    /// For rank 4 and 32 channels this is `[1, 32, 1, 1]`.
    pub fn channel_broadcast_shape(rank: usize, channels: usize) -> Vec<usize> {
        let mut dims = vec![1; rank.max(2)];
        dims[1] = channels;
        dims
    }
}

/// Shape formatting
pub mod shape_utils {
    /// Format a shape the way converter command lines expect: `[1,12,16]`
    pub fn format_shape(shape: &[usize]) -> String {
        let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
        format!("[{}]", dims.join(","))
    }

    /// Format an ordered list of shapes: `[1,16],[1,12,16]`
    pub fn format_shape_list(shapes: &[Vec<usize>]) -> String {
        shapes
            .iter()
            .map(|s| format_shape(s))
            .collect::<Vec<_>>()
            .join(",")
    }
}
