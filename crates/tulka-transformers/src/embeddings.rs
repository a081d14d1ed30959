//! Token embedding lookup.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use ndarray::{Array2, Array3};

use crate::weights::ParamLoader;

/// A token embedding table.
///
/// The table lives behind an `Arc` so it can be shared between the input
/// and output embeddings and aliased by a tied output projection without
/// any copy.
#[derive(Clone)]
pub struct Embeddings {
    table: Arc<Array2<f32>>,
}

impl Embeddings {
    pub fn new(table: Arc<Array2<f32>>) -> Self {
        Self { table }
    }

    /// Build from `{prefix}.weight`, initialized `N(0, emb_size^-0.5)`.
    pub fn build(
        loader: &mut ParamLoader,
        prefix: &str,
        vocab_size: usize,
        emb_size: usize,
    ) -> Result<Self> {
        let init_std = (emb_size as f32).powf(-0.5);
        let table = loader.take_2d(&format!("{}.weight", prefix), (vocab_size, emb_size), init_std)?;
        Ok(Self::new(Arc::new(table)))
    }

    pub fn vocab_size(&self) -> usize {
        self.table.shape()[0]
    }

    pub fn emb_size(&self) -> usize {
        self.table.shape()[1]
    }

    /// The shared table, for weight tying.
    pub fn table(&self) -> &Arc<Array2<f32>> {
        &self.table
    }

    /// Look up `[batch, len]` ids into `[batch, len, emb]` vectors.
    pub fn forward(&self, ids: &Array2<u32>) -> Result<Array3<f32>> {
        let (batch, len) = ids.dim();
        let emb = self.emb_size();
        let vocab = self.vocab_size();

        let mut out = Array3::zeros((batch, len, emb));
        for b in 0..batch {
            for t in 0..len {
                let id = ids[[b, t]] as usize;
                if id >= vocab {
                    return Err(anyhow!(
                        "token id {} out of range for vocabulary of {}",
                        id,
                        vocab
                    ));
                }
                out.slice_mut(ndarray::s![b, t, ..])
                    .assign(&self.table.row(id));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_lookup() {
        let table = Array2::from_shape_vec(
            (3, 2),
            vec![0.0, 0.1, 1.0, 1.1, 2.0, 2.1],
        )
        .unwrap();
        let emb = Embeddings::new(Arc::new(table));

        let ids = array![[2u32, 0], [1, 1]];
        let out = emb.forward(&ids).unwrap();

        assert_eq!(out.shape(), &[2, 2, 2]);
        assert_eq!(out[[0, 0, 0]], 2.0);
        assert_eq!(out[[0, 1, 1]], 0.1);
        assert_eq!(out[[1, 0, 0]], 1.0);
    }

    #[test]
    fn test_out_of_range_id_fails() {
        let emb = Embeddings::new(Arc::new(Array2::zeros((4, 2))));
        let ids = array![[5u32]];
        assert!(emb.forward(&ids).is_err());
    }

    #[test]
    fn test_shared_table_is_one_allocation() {
        let emb = Embeddings::new(Arc::new(Array2::zeros((4, 2))));
        let shared = emb.clone();
        assert!(Arc::ptr_eq(emb.table(), shared.table()));
    }
}
