//! Affine projections with the `[In, Out]` weight layout.
//!
//! Derived sub-projections (e.g. the query part of a fused Q/K/V matrix)
//! are column ranges into the owning projection's parameters, taken as
//! borrowed views at call time. There is one allocation per projection
//! regardless of how many derived views exist.

use std::ops::Range;

use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, s};

use crate::activations::{apply_activation_3d_mut, Activation};
use crate::utils::linear_algebra::matmul_3d_2d;
use crate::weights::ParamLoader;

/// A dense projection `y = activation(x . W + b)`.
pub struct Dense {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
    pub activation: Option<Activation>,
}

impl Dense {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>, activation: Option<Activation>) -> Self {
        assert_eq!(
            weight.shape()[1],
            bias.len(),
            "bias length must match output features"
        );
        Self {
            weight,
            bias,
            activation,
        }
    }

    /// Build from `{prefix}.weight` / `{prefix}.bias`.
    pub fn build(
        loader: &mut ParamLoader,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        activation: Option<Activation>,
    ) -> Result<Self> {
        let init_std = 1.0 / (in_features as f32).sqrt();
        let weight = loader.take_2d(
            &format!("{}.weight", prefix),
            (in_features, out_features),
            init_std,
        )?;
        let bias = loader.take_1d(&format!("{}.bias", prefix), out_features, 0.0)?;
        Ok(Self::new(weight, bias, activation))
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        if input.shape()[2] != self.in_features() {
            return Err(anyhow!(
                "input feature size {} does not match projection input size {}",
                input.shape()[2],
                self.in_features()
            ));
        }
        let mut out = matmul_3d_2d(input, &self.weight.view()) + &self.bias;
        if let Some(act) = self.activation {
            apply_activation_3d_mut(&mut out, act);
        }
        Ok(out)
    }

    /// Borrow the sub-projection over an output-feature range.
    pub fn slice_out(&self, range: Range<usize>) -> DenseSlice<'_> {
        assert!(
            range.end <= self.out_features(),
            "derived projection range out of bounds"
        );
        DenseSlice {
            weight: self.weight.slice(s![.., range.clone()]),
            bias: self.bias.slice(s![range]),
        }
    }
}

/// A borrowed sub-range of a [`Dense`] projection's parameters.
pub struct DenseSlice<'a> {
    pub weight: ArrayView2<'a, f32>,
    pub bias: ArrayView1<'a, f32>,
}

impl DenseSlice<'_> {
    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        if input.shape()[2] != self.weight.shape()[0] {
            return Err(anyhow!(
                "input feature size {} does not match projection input size {}",
                input.shape()[2],
                self.weight.shape()[0]
            ));
        }
        Ok(matmul_3d_2d(input, &self.weight) + &self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::WeightMap;
    use ndarray::Array3;

    #[test]
    fn test_forward_applies_weight_bias_activation() {
        let weight = Array2::from_shape_vec((2, 2), vec![1.0, 0.0, 0.0, -1.0]).unwrap();
        let bias = Array1::from_vec(vec![0.5, 0.5]);
        let dense = Dense::new(weight, bias, Some(Activation::Relu));

        let input = Array3::from_shape_vec((1, 1, 2), vec![1.0, 2.0]).unwrap();
        let out = dense.forward(&input).unwrap();

        // x.W = [1, -2], +b = [1.5, -1.5], relu = [1.5, 0]
        assert!((out[[0, 0, 0]] - 1.5).abs() < 1e-6);
        assert_eq!(out[[0, 0, 1]], 0.0);
    }

    #[test]
    fn test_feature_mismatch_is_an_error() {
        let dense = Dense::new(Array2::zeros((4, 2)), Array1::zeros(2), None);
        let input = Array3::<f32>::zeros((1, 3, 5));
        assert!(dense.forward(&input).is_err());
    }

    #[test]
    fn test_sliced_projection_matches_full_projection_columns() {
        let mut loader = ParamLoader::random(3);
        let dense = Dense::build(&mut loader, "fused", 4, 6, None).unwrap();
        let input = Array3::from_shape_fn((1, 2, 4), |(_, s, h)| (s * 4 + h) as f32 * 0.1);

        let full = dense.forward(&input).unwrap();
        let tail = dense.slice_out(2..6).forward(&input).unwrap();

        for s in 0..2 {
            for j in 0..4 {
                assert!((tail[[0, s, j]] - full[[0, s, j + 2]]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_build_from_checkpoint_validates_shape() {
        let mut map = WeightMap::new();
        map.insert("p.weight", Array2::<f32>::zeros((4, 8)));
        map.insert("p.bias", Array1::<f32>::zeros(8));
        let mut loader = ParamLoader::from_map(map);
        assert!(Dense::build(&mut loader, "p", 8, 4, None).is_err());
    }
}
