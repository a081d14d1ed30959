//! Output projection from hidden states to vocabulary logits.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, Array3};

use crate::utils::linear_algebra::{matmul_2d, matmul_3d_2d};
use crate::weights::ParamLoader;

/// The projection matrix, owned or aliased from the output embeddings.
///
/// Tied weights multiply by the shared embedding table transposed by view;
/// the table and the projection can never diverge because they are one
/// allocation.
pub enum LmHeadWeight {
    /// `[hidden, vocab]`
    Owned(Array2<f32>),
    /// The output embedding table, `[vocab, hidden]`, used transposed.
    Tied(Arc<Array2<f32>>),
}

/// Final linear map from hidden size to vocabulary logits.
pub struct LmHead {
    weight: LmHeadWeight,
    bias: Array1<f32>,
}

impl LmHead {
    /// Build an independent projection from `{prefix}.weight` / `{prefix}.bias`.
    pub fn build(
        loader: &mut ParamLoader,
        prefix: &str,
        hidden_size: usize,
        vocab_size: usize,
    ) -> Result<Self> {
        let init_std = 1.0 / (hidden_size as f32).sqrt();
        let weight = loader.take_2d(
            &format!("{}.weight", prefix),
            (hidden_size, vocab_size),
            init_std,
        )?;
        let bias = loader.take_1d(&format!("{}.bias", prefix), vocab_size, 0.0)?;
        Ok(Self {
            weight: LmHeadWeight::Owned(weight),
            bias,
        })
    }

    /// Build a projection tied to the output embedding table.
    ///
    /// Only the bias is loaded; the matrix is the shared table itself.
    pub fn build_tied(
        loader: &mut ParamLoader,
        prefix: &str,
        table: Arc<Array2<f32>>,
        hidden_size: usize,
    ) -> Result<Self> {
        if table.shape()[1] != hidden_size {
            return Err(anyhow!(
                "tied projection needs an embedding width of {}, table has {}",
                hidden_size,
                table.shape()[1]
            ));
        }
        let vocab_size = table.shape()[0];
        let bias = loader.take_1d(&format!("{}.bias", prefix), vocab_size, 0.0)?;
        Ok(Self {
            weight: LmHeadWeight::Tied(table),
            bias,
        })
    }

    pub fn vocab_size(&self) -> usize {
        match &self.weight {
            LmHeadWeight::Owned(w) => w.shape()[1],
            LmHeadWeight::Tied(t) => t.shape()[0],
        }
    }

    pub fn weight(&self) -> &LmHeadWeight {
        &self.weight
    }

    /// Logits for a batch of read-out vectors, `[batch, hidden]`.
    pub fn forward_2d(&self, hidden: &Array2<f32>) -> Array2<f32> {
        let logits = match &self.weight {
            LmHeadWeight::Owned(w) => matmul_2d(&hidden.view(), &w.view()),
            LmHeadWeight::Tied(t) => matmul_2d(&hidden.view(), &t.t()),
        };
        logits + &self.bias
    }

    /// Logits over a full sequence, `[batch, len, hidden]`.
    pub fn forward_3d(&self, hidden: &Array3<f32>) -> Array3<f32> {
        let logits = match &self.weight {
            LmHeadWeight::Owned(w) => matmul_3d_2d(hidden, &w.view()),
            LmHeadWeight::Tied(t) => matmul_3d_2d(hidden, &t.t()),
        };
        logits + &self.bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tied_weight_is_exact_transpose_of_table() {
        let table = Arc::new(Array2::from_shape_fn((6, 4), |(v, h)| {
            (v * 4 + h) as f32 * 0.1
        }));
        let mut loader = ParamLoader::random(0);
        let head = LmHead::build_tied(&mut loader, "lm_head", table.clone(), 4).unwrap();

        match head.weight() {
            LmHeadWeight::Tied(t) => assert!(Arc::ptr_eq(t, &table)),
            LmHeadWeight::Owned(_) => panic!("expected tied weight"),
        }

        // Projecting a one-hot hidden vector reads a table column.
        let mut hidden = Array2::zeros((1, 4));
        hidden[[0, 2]] = 1.0;
        let logits = head.forward_2d(&hidden);
        for v in 0..6 {
            assert!((logits[[0, v]] - table[[v, 2]]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_tied_width_mismatch_fails() {
        let table = Arc::new(Array2::<f32>::zeros((6, 4)));
        let mut loader = ParamLoader::random(0);
        assert!(LmHead::build_tied(&mut loader, "lm_head", table, 8).is_err());
    }

    #[test]
    fn test_owned_projection_shapes() {
        let mut loader = ParamLoader::random(1);
        let head = LmHead::build(&mut loader, "lm_head", 8, 12).unwrap();
        assert_eq!(head.vocab_size(), 12);

        let hidden = Array2::<f32>::ones((3, 8));
        assert_eq!(head.forward_2d(&hidden).shape(), &[3, 12]);

        let hidden3 = Array3::<f32>::ones((3, 5, 8));
        assert_eq!(head.forward_3d(&hidden3).shape(), &[3, 5, 12]);
    }
}
