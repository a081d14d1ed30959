//! Decoder stack: batch (training) path and the per-layer pieces the
//! incremental decode path reuses.

use anyhow::Result;
use ndarray::{s, Array1, Array2, Array3, Axis};

use crate::attention::{AttentionFormat, AttnMask, KvSource, MultiHeadAttention};
use crate::cache::KvCache;
use crate::common::{dropout, ExecutionMode};
use crate::embeddings::Embeddings;
use crate::feedforward::FeedForward;
use crate::normalization::LayerNorm;
use crate::positional::{add_timing_signal, random_offsets};
use crate::residual::ResidualBlock;
use crate::utils::masks::causal_mask;
use crate::weights::ParamLoader;

use super::config::TransformerConfig;

/// One decoder layer: masked self-attention, encoder cross-attention and
/// feed-forward, each in its residual pipeline.
pub struct DecoderLayer {
    self_attn: MultiHeadAttention,
    self_attn_res: ResidualBlock,
    cross_attn: MultiHeadAttention,
    cross_attn_res: ResidualBlock,
    ffn: FeedForward,
    ffn_res: ResidualBlock,
}

impl DecoderLayer {
    pub fn build(
        loader: &mut ParamLoader,
        prefix: &str,
        config: &TransformerConfig,
        in_size: usize,
    ) -> Result<Self> {
        let self_attn = MultiHeadAttention::build(
            loader,
            &format!("{}.self_attn", prefix),
            in_size,
            config.key_size(),
            config.value_size(),
            config.hidden_size,
            config.num_heads,
            config.attn_dropout,
            config.attn_value_dropout,
            AttentionFormat::Combined,
        )?;
        let self_attn_res = ResidualBlock::build(
            loader,
            &format!("{}.self_attn", prefix),
            config.res_steps.clone(),
            config.res_dropout,
            in_size,
            config.hidden_size,
        )?;
        let cross_attn = MultiHeadAttention::build(
            loader,
            &format!("{}.cross_attn", prefix),
            config.hidden_size,
            config.key_size(),
            config.value_size(),
            config.hidden_size,
            config.num_heads,
            config.attn_dropout,
            config.attn_value_dropout,
            config.cross_attn_format,
        )?;
        let cross_attn_res = ResidualBlock::build(
            loader,
            &format!("{}.cross_attn", prefix),
            config.res_steps.clone(),
            config.res_dropout,
            config.hidden_size,
            config.hidden_size,
        )?;
        let ffn = FeedForward::build(
            loader,
            &format!("{}.ffn", prefix),
            config.hidden_size,
            config.ff_size(),
            config.hidden_size,
            config.relu_dropout,
        )?;
        let ffn_res = ResidualBlock::build(
            loader,
            &format!("{}.ffn", prefix),
            config.res_steps.clone(),
            config.res_dropout,
            config.hidden_size,
            config.hidden_size,
        )?;

        Ok(Self {
            self_attn,
            self_attn_res,
            cross_attn,
            cross_attn_res,
            ffn,
            ffn_res,
        })
    }

    /// Full-prefix forward with a causal self-attention mask.
    pub fn forward_batch(
        &self,
        input: &Array3<f32>,
        causal: &Array2<f32>,
        enc_out: &Array3<f32>,
        enc_mask: &Array2<f32>,
        mode: ExecutionMode,
    ) -> Result<Array3<f32>> {
        let x = self.self_attn_res.apply(input, mode, |x| {
            self.self_attn
                .attend(x, AttnMask::Causal(causal), KvSource::SelfInput, mode)
        })?;
        let x = self.cross_attn_res.apply(&x, mode, |x| {
            self.cross_attn
                .attend(x, AttnMask::Padding(enc_mask), KvSource::Input(enc_out), mode)
        })?;
        self.ffn_res.apply(&x, mode, |x| self.ffn.forward(x, mode))
    }

    /// Single-step forward against externally supplied caches.
    ///
    /// `grown_self` must already contain the current step's key/value
    /// projection (see [`project_step_kv`](Self::project_step_kv)).
    pub fn forward_step(
        &self,
        input: &Array3<f32>,
        step_mask: &Array2<f32>,
        grown_self: &KvCache,
        cross: &KvCache,
        enc_mask: &Array2<f32>,
        mode: ExecutionMode,
    ) -> Result<Array3<f32>> {
        let x = self.self_attn_res.apply(input, mode, |x| {
            self.self_attn
                .attend(x, AttnMask::Causal(step_mask), KvSource::Cached(grown_self), mode)
        })?;
        let x = self.cross_attn_res.apply(&x, mode, |x| {
            self.cross_attn
                .attend(x, AttnMask::Padding(enc_mask), KvSource::Cached(cross), mode)
        })?;
        self.ffn_res.apply(&x, mode, |x| self.ffn.forward(x, mode))
    }

    /// Key/value projection of the current step's (preprocessed) input,
    /// ready to append onto this layer's self-attention cache.
    pub fn project_step_kv(&self, input: &Array3<f32>) -> Result<KvCache> {
        self.self_attn
            .project_kv(&self.self_attn_res.preprocess(input))
    }

    /// The frozen cross-attention cache for one encoder output.
    ///
    /// The encoder output is deliberately not preprocessed: the residual
    /// pipeline only normalizes the query side.
    pub fn precompute_cross_kv(&self, enc_out: &Array3<f32>) -> Result<KvCache> {
        self.cross_attn.project_kv(enc_out)
    }
}

/// The full decoder: embeddings, shift-right, position signal, layers.
pub struct Decoder {
    embeddings: Embeddings,
    rescale_emb: bool,
    rand_offset: bool,
    input_dropout: f32,
    pub(crate) layers: Vec<DecoderLayer>,
    pub(crate) final_norm: Option<LayerNorm>,
}

impl Decoder {
    pub fn build(
        loader: &mut ParamLoader,
        config: &TransformerConfig,
        embeddings: Embeddings,
    ) -> Result<Self> {
        let layers = (0..config.num_layers)
            .map(|i| {
                let in_size = if i == 0 {
                    config.emb_size()
                } else {
                    config.hidden_size
                };
                DecoderLayer::build(loader, &format!("decoder.layers.{}", i), config, in_size)
            })
            .collect::<Result<Vec<_>>>()?;

        let final_norm = if config.normalize_out {
            let size = if config.num_layers == 0 {
                config.emb_size()
            } else {
                config.hidden_size
            };
            Some(LayerNorm::build(loader, "decoder.final_norm", size)?)
        } else {
            None
        };

        Ok(Self {
            embeddings,
            rescale_emb: config.rescale_emb,
            rand_offset: config.dst_rand_offset,
            input_dropout: config.res_dropout,
            layers,
            final_norm,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub(crate) fn embed_tokens(&self, ids: &Array2<u32>) -> Result<Array3<f32>> {
        let mut emb = self.embeddings.forward(ids)?;
        if self.rescale_emb {
            emb *= (self.embeddings.emb_size() as f32).sqrt();
        }
        Ok(emb)
    }

    pub(crate) fn emb_size(&self) -> usize {
        self.embeddings.emb_size()
    }

    pub(crate) fn input_dropout(&self) -> f32 {
        self.input_dropout
    }

    pub(crate) fn initial_offsets(&self, batch: usize, mode: ExecutionMode) -> Array1<f32> {
        if self.rand_offset && mode.is_training() {
            random_offsets(batch)
        } else {
            Array1::zeros(batch)
        }
    }

    /// Full-prefix decode for training-time scoring.
    ///
    /// Position `i` of the result is predicted from positions `< i`: the
    /// target embeddings are shifted right by one step before the stack.
    pub fn forward_batch(
        &self,
        output_ids: &Array2<u32>,
        reverse: Option<&[bool]>,
        enc_out: &Array3<f32>,
        enc_mask: &Array2<f32>,
        mode: ExecutionMode,
    ) -> Result<Array3<f32>> {
        let (batch, n_out) = output_ids.dim();
        let emb = self.embed_tokens(output_ids)?;
        let emb = shift_right(&emb);

        let offsets = self.initial_offsets(batch, mode);
        let mut hidden = add_timing_signal(&emb, &offsets, reverse);
        hidden = dropout(hidden, self.input_dropout, mode);

        if self.layers.is_empty() {
            hidden += &encoder_bypass(enc_out, enc_mask);
        }

        let causal = causal_mask(n_out, n_out);
        for layer in &self.layers {
            hidden = layer.forward_batch(&hidden, &causal, enc_out, enc_mask, mode)?;
        }

        if let Some(norm) = &self.final_norm {
            hidden = norm.forward_3d(&hidden);
        }

        Ok(hidden)
    }
}

/// Drop the last position's embedding and insert zeros at position 0.
pub(crate) fn shift_right(emb: &Array3<f32>) -> Array3<f32> {
    let (batch, n, width) = emb.dim();
    let mut shifted = Array3::zeros((batch, n, width));
    if n > 1 {
        shifted
            .slice_mut(s![.., 1.., ..])
            .assign(&emb.slice(s![.., ..n - 1, ..]));
    }
    shifted
}

/// Mean of the padding-masked encoder output, `[1, 1, hidden]`.
///
/// A zero-layer decoder adds this into its input so encoder information
/// still reaches the output projection.
pub(crate) fn encoder_bypass(enc_out: &Array3<f32>, enc_mask: &Array2<f32>) -> Array3<f32> {
    let masked = enc_out * &enc_mask.view().insert_axis(Axis(2));
    let hidden = enc_out.shape()[2];
    let count = (enc_out.shape()[0] * enc_out.shape()[1]) as f32;
    let mut mean = Array3::zeros((1, 1, hidden));
    for h in 0..hidden {
        mean[[0, 0, h]] = masked.slice(s![.., .., h]).sum() / count;
    }
    mean
}
