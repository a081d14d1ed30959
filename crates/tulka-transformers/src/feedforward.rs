//! Position-wise feed-forward block.

use anyhow::Result;
use ndarray::Array3;

use crate::activations::Activation;
use crate::common::{dropout, ExecutionMode};
use crate::linear_layer::Dense;
use crate::weights::ParamLoader;

/// Two affine layers with a ReLU and dropout on the hidden activation.
/// Purely position-wise: nothing mixes across the sequence axis.
pub struct FeedForward {
    fc1: Dense,
    fc2: Dense,
    relu_dropout: f32,
}

impl FeedForward {
    /// Build from `{prefix}.fc1` / `{prefix}.fc2`.
    pub fn build(
        loader: &mut ParamLoader,
        prefix: &str,
        in_size: usize,
        hidden_size: usize,
        out_size: usize,
        relu_dropout: f32,
    ) -> Result<Self> {
        let fc1 = Dense::build(
            loader,
            &format!("{}.fc1", prefix),
            in_size,
            hidden_size,
            Some(Activation::Relu),
        )?;
        let fc2 = Dense::build(loader, &format!("{}.fc2", prefix), hidden_size, out_size, None)?;
        Ok(Self {
            fc1,
            fc2,
            relu_dropout,
        })
    }

    pub fn out_size(&self) -> usize {
        self.fc2.out_features()
    }

    pub fn forward(&self, input: &Array3<f32>, mode: ExecutionMode) -> Result<Array3<f32>> {
        let hidden = self.fc1.forward(input)?;
        let hidden = dropout(hidden, self.relu_dropout, mode);
        self.fc2.forward(&hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_forward_shapes() {
        let mut loader = ParamLoader::random(1);
        let ffn = FeedForward::build(&mut loader, "ffn", 8, 16, 8, 0.0).unwrap();
        let x = Array3::<f32>::ones((2, 3, 8));
        let y = ffn.forward(&x, ExecutionMode::Inference).unwrap();
        assert_eq!(y.shape(), &[2, 3, 8]);
    }

    #[test]
    fn test_position_wise() {
        // Changing one position leaves every other position untouched.
        let mut loader = ParamLoader::random(4);
        let ffn = FeedForward::build(&mut loader, "ffn", 8, 16, 8, 0.0).unwrap();

        let x1 = Array3::from_shape_fn((1, 4, 8), |(_, t, h)| (t + h) as f32 * 0.1);
        let mut x2 = x1.clone();
        x2.slice_mut(ndarray::s![.., 2, ..]).fill(-3.0);

        let y1 = ffn.forward(&x1, ExecutionMode::Inference).unwrap();
        let y2 = ffn.forward(&x2, ExecutionMode::Inference).unwrap();

        for t in [0usize, 1, 3] {
            for h in 0..8 {
                assert_eq!(y1[[0, t, h]], y2[[0, t, h]]);
            }
        }
    }
}
