//! The full encoder-decoder model.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use ndarray::{Array2, Array3};

use crate::common::ExecutionMode;
use crate::embeddings::Embeddings;
use crate::lm_head::LmHead;
use crate::weights::{ParamLoader, WeightMap};

use super::config::{TransformerConfig, VocabSpec};
use super::decoder::Decoder;
use super::encoder::Encoder;

/// Encoder-decoder transformer with an incremental decode path.
///
/// Parameters are created once at construction and never mutated; any
/// number of forward or decode calls may run concurrently against one
/// model as long as each owns its `DecodeState`.
impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model").finish_non_exhaustive()
    }
}

pub struct Model {
    pub(crate) config: TransformerConfig,
    pub(crate) vocab: VocabSpec,
    pub(crate) encoder: Encoder,
    pub(crate) decoder: Decoder,
    pub(crate) lm_head: LmHead,
    out_embeddings: Embeddings,
}

impl Model {
    /// Build every component through one loader.
    pub fn new(
        config: TransformerConfig,
        vocab: VocabSpec,
        loader: &mut ParamLoader,
    ) -> Result<Self> {
        config.validate()?;

        let (inp_embeddings, out_embeddings) = if config.share_emb {
            let size = vocab.inp_size.max(vocab.out_size);
            let shared = Embeddings::build(loader, "emb_shared", size, config.emb_size())?;
            (shared.clone(), shared)
        } else {
            (
                Embeddings::build(loader, "emb_inp", vocab.inp_size, config.emb_size())?,
                Embeddings::build(loader, "emb_out", vocab.out_size, config.emb_size())?,
            )
        };

        let encoder = Encoder::build(loader, &config, inp_embeddings)?;
        let decoder = Decoder::build(loader, &config, out_embeddings.clone())?;

        let lm_head = if config.tie_output_emb {
            LmHead::build_tied(
                loader,
                "lm_head",
                out_embeddings.table().clone(),
                config.hidden_size,
            )?
        } else {
            LmHead::build(loader, "lm_head", config.hidden_size, vocab.out_size)?
        };

        Ok(Self {
            config,
            vocab,
            encoder,
            decoder,
            lm_head,
            out_embeddings,
        })
    }

    /// Build from a checkpoint mapping.
    ///
    /// Fails before any inference if the mapping's name set differs from
    /// the model's parameter set in either direction.
    pub fn from_weights(
        config: TransformerConfig,
        vocab: VocabSpec,
        weights: WeightMap,
    ) -> Result<Self> {
        let mut loader = ParamLoader::from_map(weights);
        let model = Self::new(config, vocab, &mut loader)?;
        loader.finish()?;
        Ok(model)
    }

    /// Build with seeded random initialization.
    pub fn random(config: TransformerConfig, vocab: VocabSpec, seed: u64) -> Result<Self> {
        let mut loader = ParamLoader::random(seed);
        Self::new(config, vocab, &mut loader)
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn vocab(&self) -> &VocabSpec {
        &self.vocab
    }

    pub fn lm_head(&self) -> &LmHead {
        &self.lm_head
    }

    /// The output embedding table (the tied projection aliases it).
    pub fn output_embedding_table(&self) -> &Arc<ndarray::Array2<f32>> {
        self.out_embeddings.table()
    }

    /// Training-path scoring: logits for every target position.
    ///
    /// Position `i` of the result is the next-token distribution after
    /// the prefix `out[.. i]`. Returns `[batch, n_out, vocab]`.
    pub fn score(
        &self,
        inp: &Array2<u32>,
        out: &Array2<u32>,
        mode: ExecutionMode,
    ) -> Result<Array3<f32>> {
        let lengths = infer_lengths(inp, self.vocab.inp_eos);
        let (enc_out, enc_mask) = self.encoder.encode(inp, &lengths, mode)?;
        let dec_out = self
            .decoder
            .forward_batch(out, None, &enc_out, &enc_mask, mode)?;
        Ok(self.lm_head.forward_3d(&dec_out))
    }

    pub(crate) fn resolve_lengths(
        &self,
        inp: &Array2<u32>,
        inp_len: Option<&[usize]>,
    ) -> Result<Vec<usize>> {
        match inp_len {
            Some(lengths) => {
                if lengths.len() != inp.nrows() {
                    return Err(anyhow!(
                        "got {} lengths for a batch of {}",
                        lengths.len(),
                        inp.nrows()
                    ));
                }
                Ok(lengths.to_vec())
            }
            None => Ok(infer_lengths(inp, self.vocab.inp_eos)),
        }
    }
}

/// Valid length of each row: everything up to and including the first
/// end-of-sequence id, or the full row if none is present.
pub fn infer_lengths(ids: &Array2<u32>, eos: u32) -> Vec<usize> {
    ids.outer_iter()
        .map(|row| {
            row.iter()
                .position(|&id| id == eos)
                .map(|pos| pos + 1)
                .unwrap_or(row.len())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_infer_lengths() {
        let ids = array![[5u32, 8, 2, 2], [2, 0, 0, 0], [5, 8, 9, 7]];
        assert_eq!(infer_lengths(&ids, 2), vec![3, 1, 4]);
    }
}
