//! Activation functions and softmax operations.

use std::str::FromStr;

use libm::{erff, expf, tanhf};
use ndarray::{s, Array3, Array4, ArrayViewMut1};
use serde::{Deserialize, Serialize};

/// Minimum array size for parallel execution.
pub const PARALLEL_THRESHOLD: usize = 16_384;

const SQRT_2_INV: f32 = 0.7071067811865475;

/// Supported activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Gelu,
    Relu,
    Tanh,
}

impl FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gelu" => Ok(Activation::Gelu),
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            _ => Err(format!("unknown activation function: {}", s)),
        }
    }
}

impl Default for Activation {
    fn default() -> Self {
        Activation::Relu
    }
}

#[inline(always)]
pub fn gelu_scalar(x: f32) -> f32 {
    0.5 * x * (1.0 + erff(x * SQRT_2_INV))
}

#[inline(always)]
pub fn relu_scalar(x: f32) -> f32 {
    x.max(0.0)
}

#[inline(always)]
pub fn tanh_scalar(x: f32) -> f32 {
    tanhf(x)
}

/// Applies an activation in-place to a 3D array of activations.
pub fn apply_activation_3d_mut(arr: &mut Array3<f32>, activation: Activation) {
    let use_parallel = arr.len() >= PARALLEL_THRESHOLD;
    match (activation, use_parallel) {
        (Activation::Gelu, true) => arr.par_mapv_inplace(gelu_scalar),
        (Activation::Gelu, false) => arr.mapv_inplace(gelu_scalar),
        (Activation::Relu, true) => arr.par_mapv_inplace(relu_scalar),
        (Activation::Relu, false) => arr.mapv_inplace(relu_scalar),
        (Activation::Tanh, true) => arr.par_mapv_inplace(tanh_scalar),
        (Activation::Tanh, false) => arr.mapv_inplace(tanh_scalar),
    }
}

/// Applies softmax in-place to a contiguous slice.
pub fn softmax_inplace(slice: &mut [f32]) {
    if slice.is_empty() {
        return;
    }

    let max = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));

    let mut sum = 0.0;
    for v in slice.iter_mut() {
        *v = expf(*v - max);
        sum += *v;
    }

    if sum > 0.0 {
        let scale = 1.0 / sum;
        for v in slice.iter_mut() {
            *v *= scale;
        }
    }
}

fn softmax_row(mut row: ArrayViewMut1<f32>) {
    if let Some(slice) = row.as_slice_mut() {
        softmax_inplace(slice);
    } else {
        let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|x| expf(x - max));
        let sum = row.sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
}

/// Applies softmax along the last axis of a 4D score tensor.
pub fn softmax_4d_inplace(scores: &mut Array4<f32>) {
    let (batch_size, num_heads, q_len, _) = scores.dim();

    for b in 0..batch_size {
        for h in 0..num_heads {
            for q in 0..q_len {
                softmax_row(scores.slice_mut(s![b, h, q, ..]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_relu() {
        assert_eq!(relu_scalar(-1.5), 0.0);
        assert_eq!(relu_scalar(0.0), 0.0);
        assert_eq!(relu_scalar(2.5), 2.5);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut scores = Array4::from_shape_fn((1, 2, 3, 4), |(_, h, q, k)| {
            (h + q + k) as f32 * 0.3 - 1.0
        });
        softmax_4d_inplace(&mut scores);

        for h in 0..2 {
            for q in 0..3 {
                let sum: f32 = (0..4).map(|k| scores[[0, h, q, k]]).sum();
                assert!((sum - 1.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_softmax_large_negative_bias_zeroes_position() {
        let mut row = vec![0.5, -1e9, 0.2];
        softmax_inplace(&mut row);
        assert_eq!(row[1], 0.0);
        assert!((row[0] + row[2] - 1.0).abs() < 1e-6);
    }
}
