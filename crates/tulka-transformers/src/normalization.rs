//! Layer normalization implementation

use anyhow::Result;
use ndarray::{Array1, Array3, ArrayView3, Axis};

use crate::weights::ParamLoader;

/// Layer normalization over the trailing (feature) axis.
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    /// Build from `{prefix}.weight` / `{prefix}.bias`.
    pub fn build(loader: &mut ParamLoader, prefix: &str, size: usize) -> Result<Self> {
        let weight = loader.take_1d(&format!("{}.weight", prefix), size, 1.0)?;
        let bias = loader.take_1d(&format!("{}.bias", prefix), size, 0.0)?;
        Ok(Self::new(weight, bias, 1e-6))
    }

    pub fn size(&self) -> usize {
        self.weight.len()
    }

    #[inline]
    pub fn forward(&self, hidden_states: &ArrayView3<f32>) -> Array3<f32> {
        let mean = hidden_states.mean_axis(Axis(2)).unwrap();
        let variance = hidden_states.var_axis(Axis(2), 0.0);

        let mean_expanded = mean.insert_axis(Axis(2));
        let var_expanded = variance.insert_axis(Axis(2));

        let inv_std = (&var_expanded + self.eps).mapv(|x| 1.0 / x.sqrt());
        let normalized = (hidden_states.to_owned() - &mean_expanded) * &inv_std;

        normalized * &self.weight + &self.bias
    }

    pub fn forward_3d(&self, hidden: &Array3<f32>) -> Array3<f32> {
        self.forward(&hidden.view())
    }
}
